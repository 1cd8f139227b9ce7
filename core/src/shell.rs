//! One managed shell: state machine, capture buffer, and timers.
//!
//! All mutable state lives behind a single mutex, so every mutation to a
//! shell is serialized and a poll observes either the full effect of an
//! output chunk or none of it. The pump task is the only writer of pty
//! output; the scheduler is the only driver of time-based transitions; tool
//! handlers mutate through `send_input`/`stop`/`check`.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use shellherd_utils_pty::PtySession;
use shellherd_utils_pty::SpawnedPty;

use crate::classifier::EventClassifier;
use crate::classifier::NotableEvents;
use crate::classifier::NotableKind;
use crate::classifier::RECENT_WINDOW_LINES;
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::ring_buffer::RingLogBuffer;
use crate::summary::NO_NOTABLE_EVENTS;
use crate::summary::TransitionNote;
use crate::summary::compose_message;

#[cfg(unix)]
const SIGINT_NUM: i32 = libc::SIGINT;
#[cfg(unix)]
const SIGKILL_NUM: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGINT_NUM: i32 = 2;
#[cfg(not(unix))]
const SIGKILL_NUM: i32 = 9;

/// Conventional exit code of a shell killed by SIGINT.
const SIGINT_EXIT_CODE: i32 = 128 + SIGINT_NUM;
/// ETX; delivers SIGINT to the pty's foreground process group.
const CTRL_C: u8 = 0x03;

const SETTLE_POLL: Duration = Duration::from_millis(25);
const EXIT_DRAIN: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellState {
    Starting,
    Verifying,
    Active,
    Stopping,
    Stopped,
    Crashed,
}

impl ShellState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ShellState::Stopped | ShellState::Crashed)
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShellState::Starting => "starting",
            ShellState::Verifying => "verifying",
            ShellState::Active => "active",
            ShellState::Stopping => "stopping",
            ShellState::Stopped => "stopped",
            ShellState::Crashed => "crashed",
        };
        write!(f, "{name}")
    }
}

/// The JSON body of every status-producing tool result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellSnapshot {
    pub label: String,
    pub status: ShellState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub message: String,
    pub logs: Vec<String>,
}

/// Minimal per-shell entry for `list_shells`.
#[derive(Debug, Clone, Serialize)]
pub struct ShellListEntry {
    pub label: String,
    pub status: ShellState,
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct PromptCandidate {
    line: String,
    /// True when the candidate is the buffer's unterminated fragment and
    /// must be flushed into the buffer on confirmation.
    pending_partial: bool,
}

#[derive(Debug)]
struct ShellInner {
    state: ShellState,
    buffer: RingLogBuffer,
    classifier: EventClassifier,
    events: NotableEvents,
    transition: Option<TransitionNote>,
    poll_cursor: u64,
    has_polled: bool,
    pid: Option<u32>,
    verify_deadline: Option<Instant>,
    verify_timeout_ms: u64,
    last_output_at: Instant,
    prompt_candidate: Option<PromptCandidate>,
    stop_requested_at: Option<Instant>,
    grace_deadline: Option<Instant>,
    kill_deadline: Option<Instant>,
    interrupt_sent: bool,
    sigkill_sent: bool,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    started_at: SystemTime,
    updated_at: SystemTime,
}

impl ShellInner {
    /// Classify one completed line and evaluate verification. Counters and
    /// transitions only; the caller already appended the line.
    fn ingest_line(&mut self, line: &str) {
        for kind in self.classifier.classify(line) {
            self.events.record(kind, line);
        }
        if self.state == ShellState::Verifying {
            let window = self.buffer.recent_window(RECENT_WINDOW_LINES);
            if self.classifier.verification_matches(line, &window) {
                self.state = ShellState::Active;
                self.verify_deadline = None;
                let pattern = self
                    .classifier
                    .verification_source()
                    .unwrap_or_default()
                    .to_string();
                self.transition = Some(TransitionNote::VerificationMatched { pattern });
            }
        }
    }

    fn snapshot(&self, label: &str, log_lines: usize, suppress_logs: bool) -> ShellSnapshot {
        ShellSnapshot {
            label: label.to_string(),
            status: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            exit_signal: self.exit_signal,
            message: compose_message(self.transition.as_ref(), &self.events),
            logs: if suppress_logs {
                Vec::new()
            } else {
                self.buffer.lines_after(self.poll_cursor, log_lines)
            },
        }
    }
}

pub struct ManagedShell {
    label: String,
    command: String,
    config: SupervisorConfig,
    session: OnceLock<Arc<PtySession>>,
    inner: StdMutex<ShellInner>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl ManagedShell {
    pub fn new(
        label: String,
        command: String,
        classifier: EventClassifier,
        verify_timeout_ms: u64,
        config: SupervisorConfig,
    ) -> Self {
        let now = SystemTime::now();
        let inner = ShellInner {
            state: ShellState::Starting,
            buffer: RingLogBuffer::new(config.max_log_lines, config.max_line_bytes),
            classifier,
            events: NotableEvents::default(),
            transition: None,
            poll_cursor: 0,
            has_polled: false,
            pid: None,
            verify_deadline: None,
            verify_timeout_ms,
            last_output_at: Instant::now(),
            prompt_candidate: None,
            stop_requested_at: None,
            grace_deadline: None,
            kill_deadline: None,
            interrupt_sent: false,
            sigkill_sent: false,
            exit_code: None,
            exit_signal: None,
            started_at: now,
            updated_at: now,
        };
        Self {
            label,
            command,
            config,
            session: OnceLock::new(),
            inner: StdMutex::new(inner),
            pump: StdMutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock(&self) -> MutexGuard<'_, ShellInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ShellState {
        self.lock().state
    }

    /// Wire the spawned pty into the shell and leave `starting`.
    pub fn attach(self: &Arc<Self>, spawned: SpawnedPty) {
        let SpawnedPty {
            session,
            output_rx,
            exit_rx,
        } = spawned;
        let session = Arc::new(session);
        let _ = self.session.set(Arc::clone(&session));

        {
            let mut inner = self.lock();
            inner.pid = session.pid();
            inner.last_output_at = Instant::now();
            inner.updated_at = SystemTime::now();
            if inner.classifier.has_verification() {
                inner.state = ShellState::Verifying;
                inner.verify_deadline =
                    Some(Instant::now() + Duration::from_millis(inner.verify_timeout_ms));
            } else {
                inner.state = ShellState::Active;
            }
        }

        let shell = Arc::clone(self);
        let handle = tokio::spawn(shell.pump_loop(output_rx, exit_rx));
        *self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    async fn pump_loop(
        self: Arc<Self>,
        mut output_rx: broadcast::Receiver<Vec<u8>>,
        mut exit_rx: tokio::sync::oneshot::Receiver<i32>,
    ) {
        loop {
            tokio::select! {
                exit = &mut exit_rx => {
                    let code = exit.unwrap_or(-1);
                    // Drain whatever the reader already queued before the
                    // exit notification raced ahead of it.
                    let drain_deadline = Instant::now() + EXIT_DRAIN;
                    while Instant::now() < drain_deadline {
                        match timeout(Duration::from_millis(1), output_rx.recv()).await {
                            Ok(Ok(chunk)) => self.on_output(&chunk),
                            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                            Ok(Err(broadcast::error::RecvError::Closed)) => break,
                            Err(_) => break,
                        }
                    }
                    self.on_exit(code);
                    break;
                }
                chunk = output_rx.recv() => {
                    match chunk {
                        Ok(chunk) => self.on_output(&chunk),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            let code = (&mut exit_rx).await.unwrap_or(-1);
                            self.on_exit(code);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// The shell could not be spawned at all. The record stays addressable
    /// so the caller can inspect the failure.
    pub fn mark_spawn_failed(&self, error: &str) {
        let mut inner = self.lock();
        let line = inner
            .buffer
            .push_synthesized(format!("failed to spawn '{}': {error}", self.command))
            .1;
        inner.ingest_line(&line);
        inner.state = ShellState::Crashed;
        inner.transition = Some(TransitionNote::Crashed {
            exit_code: None,
            exit_signal: None,
        });
        inner.updated_at = SystemTime::now();
    }

    /// Append a pty chunk: buffer, classify, re-arm the settle clock.
    pub fn on_output(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.last_output_at = Instant::now();
        inner.updated_at = SystemTime::now();

        let completed = inner.buffer.append_bytes(chunk);
        for (_, line) in &completed {
            inner.ingest_line(line);
        }

        // A prompt candidate must be the most recent output.
        let candidate = {
            let partial = inner.buffer.partial();
            if !partial.is_empty() {
                EventClassifier::is_prompt_candidate(partial).then(|| PromptCandidate {
                    line: partial.to_string(),
                    pending_partial: true,
                })
            } else {
                completed.last().and_then(|(_, line)| {
                    EventClassifier::is_prompt_candidate(line).then(|| PromptCandidate {
                        line: line.clone(),
                        pending_partial: false,
                    })
                })
            }
        };
        inner.prompt_candidate = candidate;
    }

    /// The child exited. Classify the terminal state and freeze the timers.
    pub fn on_exit(&self, code: i32) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        if let Some((_, line)) = inner.buffer.flush_partial() {
            inner.ingest_line(&line);
        }
        inner.prompt_candidate = None;
        inner.verify_deadline = None;
        inner.grace_deadline = None;
        inner.kill_deadline = None;

        inner.exit_code = Some(code);
        inner.exit_signal = if inner.sigkill_sent {
            Some(SIGKILL_NUM)
        } else if inner.interrupt_sent && code == SIGINT_EXIT_CODE {
            Some(SIGINT_NUM)
        } else {
            None
        };

        if inner.stop_requested_at.is_some() || code == 0 {
            inner.state = ShellState::Stopped;
        } else {
            inner.state = ShellState::Crashed;
            inner.transition = Some(TransitionNote::Crashed {
                exit_code: inner.exit_code,
                exit_signal: inner.exit_signal,
            });
        }
        inner.pid = None;
        inner.updated_at = SystemTime::now();
        debug!(
            label = %self.label,
            code,
            uptime_ms = inner
                .started_at
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "shell exited"
        );
    }

    /// Consuming poll: emits the delta since the previous poll, then
    /// advances the cursor and resets the event counters.
    pub fn check(&self, log_lines: usize) -> ShellSnapshot {
        let mut inner = self.lock();
        // The first poll always carries the backlog; afterwards a poll with
        // nothing notable suppresses its logs behind the sentinel.
        let suppress =
            inner.has_polled && inner.events.is_empty() && inner.transition.is_none();
        let snapshot = inner.snapshot(&self.label, log_lines, suppress);
        inner.poll_cursor = inner.buffer.total_appended();
        inner.events.reset();
        inner.transition = None;
        inner.has_polled = true;
        snapshot
    }

    /// Non-consuming view used by `start_shell` and `stop_shell`: repeated
    /// calls on a quiescent shell return identical snapshots.
    pub fn snapshot_now(&self, log_lines: usize) -> ShellSnapshot {
        let inner = self.lock();
        inner.snapshot(&self.label, log_lines, false)
    }

    pub fn list_entry(&self) -> ShellListEntry {
        let inner = self.lock();
        ShellListEntry {
            label: self.label.clone(),
            status: inner.state,
            pid: inner.pid,
        }
    }

    pub fn started_at(&self) -> SystemTime {
        self.lock().started_at
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stop_requested_at.is_some()
    }

    /// Write to the child's stdin, then wait (bounded) for the output it
    /// provokes to settle before snapshotting.
    pub async fn send_input(&self, input: &str, append_newline: bool) -> Result<ShellSnapshot> {
        {
            let inner = self.lock();
            match inner.state {
                ShellState::Verifying | ShellState::Active => {}
                state => return Err(SupervisorError::WrongState(state)),
            }
        }

        let Some(session) = self.session.get() else {
            return Err(SupervisorError::PtyClosed);
        };
        let mut bytes = input.as_bytes().to_vec();
        if append_newline {
            bytes.push(b'\n');
        }
        if session.writer_sender().send(bytes).await.is_err() {
            self.mark_pty_closed();
            return Err(SupervisorError::PtyClosed);
        }

        let wrote_at = Instant::now();
        let deadline = wrote_at + self.config.input_settle;
        loop {
            sleep(SETTLE_POLL).await;
            let now = Instant::now();
            let last_output_at = self.lock().last_output_at;
            let quiet_since = last_output_at.max(wrote_at);
            if now.duration_since(quiet_since) >= self.config.quiet_window || now >= deadline {
                break;
            }
        }

        Ok(self.check(crate::supervisor::DEFAULT_CHECK_LOG_LINES))
    }

    /// Request termination. Idempotent; `force` skips the grace period.
    pub fn stop(&self, force: bool) -> ShellSnapshot {
        let kill_now = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return inner.snapshot(&self.label, crate::supervisor::DEFAULT_CHECK_LOG_LINES, false);
            }
            let now = Instant::now();
            if inner.stop_requested_at.is_none() {
                inner.stop_requested_at = Some(now);
            }
            inner.state = ShellState::Stopping;
            inner.updated_at = SystemTime::now();
            if force && !inner.sigkill_sent {
                inner.sigkill_sent = true;
                inner.grace_deadline = None;
                inner.kill_deadline = Some(now + self.config.kill_wait);
                true
            } else if !force && !inner.interrupt_sent {
                inner.interrupt_sent = true;
                inner.grace_deadline = Some(now + self.config.grace);
                false
            } else {
                false
            }
        };

        if kill_now {
            self.deliver_sigkill();
        } else {
            // Graceful path: ETX through the pty. Failure is tolerated; the
            // scheduler escalates to SIGKILL at the grace deadline.
            if let Some(session) = self.session.get()
                && session.writer_sender().try_send(vec![CTRL_C]).is_err()
            {
                warn!(label = %self.label, "failed to deliver interrupt; will escalate");
            }
        }

        self.snapshot_now(crate::supervisor::DEFAULT_CHECK_LOG_LINES)
    }

    /// One scheduler tick. Returns an error only for faults that should
    /// crash this shell; the scheduler isolates them.
    pub fn tick(&self, now: Instant) -> std::result::Result<(), String> {
        let mut kill_needed = false;
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return Ok(());
            }

            if inner.state == ShellState::Verifying
                && let Some(deadline) = inner.verify_deadline
                && now >= deadline
            {
                inner.state = ShellState::Active;
                inner.verify_deadline = None;
                inner.transition = Some(TransitionNote::VerificationTimedOut {
                    timeout_ms: inner.verify_timeout_ms,
                });
            }

            if inner.state == ShellState::Stopping {
                if !inner.sigkill_sent
                    && let Some(deadline) = inner.grace_deadline
                    && now >= deadline
                {
                    inner.sigkill_sent = true;
                    inner.grace_deadline = None;
                    inner.kill_deadline = Some(now + self.config.kill_wait);
                    kill_needed = true;
                }
                if let Some(deadline) = inner.kill_deadline
                    && now >= deadline
                {
                    let line = inner
                        .buffer
                        .push_synthesized("warning: reaped zombie; exit was never observed")
                        .1;
                    inner.ingest_line(&line);
                    inner.kill_deadline = None;
                    inner.exit_code = None;
                    inner.exit_signal = None;
                    inner.pid = None;
                    inner.state = ShellState::Stopped;
                    inner.updated_at = SystemTime::now();
                }
            }

            if matches!(inner.state, ShellState::Verifying | ShellState::Active)
                && inner.prompt_candidate.is_some()
                && now.duration_since(inner.last_output_at) >= self.config.prompt_quiet
                && let Some(candidate) = inner.prompt_candidate.take()
            {
                if candidate.pending_partial {
                    if let Some((_, line)) = inner.buffer.flush_partial() {
                        inner.ingest_line(&line);
                        inner.events.record(NotableKind::Prompt, &line);
                    }
                } else {
                    inner.events.record(NotableKind::Prompt, &candidate.line);
                }
            }
        }

        if kill_needed {
            self.deliver_sigkill();
        }

        // Exit fallback: only once the pump is done, so trailing output is
        // never cut off by an early terminal transition.
        if let Some(session) = self.session.get()
            && session.has_exited()
            && self.pump_finished()
            && !self.lock().state.is_terminal()
        {
            self.on_exit(session.exit_code().unwrap_or(-1));
        }

        Ok(())
    }

    /// Scheduler-isolated failure: this shell crashes, others continue.
    pub fn mark_internal_crash(&self, diagnostic: &str) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        let line = inner
            .buffer
            .push_synthesized(format!("supervisor error: {diagnostic}"))
            .1;
        inner.ingest_line(&line);
        inner.pid = None;
        inner.state = ShellState::Crashed;
        inner.transition = Some(TransitionNote::Crashed {
            exit_code: None,
            exit_signal: None,
        });
        inner.updated_at = SystemTime::now();
    }

    fn mark_pty_closed(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        let line = inner.buffer.push_synthesized("pty closed while writing input").1;
        inner.ingest_line(&line);
        inner.pid = None;
        inner.state = ShellState::Crashed;
        inner.transition = Some(TransitionNote::Crashed {
            exit_code: None,
            exit_signal: None,
        });
        inner.updated_at = SystemTime::now();
    }

    fn deliver_sigkill(&self) {
        if let Some(session) = self.session.get()
            && let Err(err) = session.kill()
        {
            warn!(label = %self.label, %err, "SIGKILL delivery failed");
        }
    }

    fn pump_finished(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }
}

impl Drop for ManagedShell {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pump.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ManagedShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ManagedShell")
            .field("label", &self.label)
            .field("command", &self.command)
            .field("state", &inner.state)
            .field("updated_at", &inner.updated_at)
            .finish()
    }
}

/// Snapshot helper: true when the snapshot carries the sentinel message.
pub fn is_no_news(snapshot: &ShellSnapshot) -> bool {
    snapshot.message == NO_NOTABLE_EVENTS
}
