//! Pty transport for supervised shells.
//!
//! A [`PtySession`] owns the child process and the pty pair. Output bytes are
//! fanned out on a broadcast channel, stdin bytes are drained from an mpsc
//! channel, and exit is observed by a blocking wait task and reported once on
//! a oneshot. The session is a byte-stream transport only: line splitting,
//! escape stripping, and lifecycle classification happen in the supervisor.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const READ_CHUNK_BYTES: usize = 8_192;

pub struct PtySession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    killer: StdMutex<Option<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
    reader_handle: StdMutex<Option<JoinHandle<()>>>,
    writer_handle: StdMutex<Option<JoinHandle<()>>>,
    wait_handle: StdMutex<Option<JoinHandle<()>>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<StdMutex<Option<i32>>>,
    pid: Arc<StdMutex<Option<u32>>>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("exited", &self.exited)
            .field("exit_code", &self.exit_code)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Sender for bytes destined for the child's stdin.
    pub fn writer_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer_tx.clone()
    }

    /// Fresh subscription to the child's output stream. Chunks produced
    /// before the subscription are not replayed.
    pub fn output_receiver(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|guard| *guard)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|guard| *guard)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let guard = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("pty master lock poisoned"))?;
        let Some(master) = guard.as_ref() else {
            anyhow::bail!("pty master already closed");
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Deliver SIGKILL to the child. Idempotent: killing an already-dead
    /// child reports success.
    pub fn kill(&self) -> Result<(), String> {
        let mut guard = self
            .killer
            .lock()
            .map_err(|_| "pty killer lock poisoned".to_string())?;
        match guard.as_mut() {
            Some(killer) => killer.kill().map_err(|err| err.to_string()),
            None => Ok(()),
        }
    }
}

/// Kills the process group for the given PID using SIGKILL.
///
/// portable_pty calls setsid() in the child, so pgid == pid and killpg()
/// reaches all descendants. ESRCH (already gone) is not an error.
#[cfg(unix)]
fn kill_child_process_group(pid: u32) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
        return Ok(());
    }

    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
    }

    Ok(())
}

impl Drop for PtySession {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Ok(mut pid_guard) = self.pid.lock()
            && let Some(pid) = pid_guard.take()
            && let Err(e) = kill_child_process_group(pid)
        {
            trace!("failed to kill process group for pid {pid}: {e}");
        }

        if let Ok(mut killer_opt) = self.killer.lock()
            && let Some(mut killer) = killer_opt.take()
        {
            let _ = killer.kill();
        }

        for handle in [&self.reader_handle, &self.writer_handle, &self.wait_handle] {
            if let Ok(mut guard) = handle.lock()
                && let Some(task) = guard.take()
            {
                task.abort();
            }
        }

        if let Ok(mut guard) = self.master.lock() {
            guard.take();
        }
    }
}

#[derive(Debug)]
pub struct SpawnedPty {
    pub session: PtySession,
    pub output_rx: broadcast::Receiver<Vec<u8>>,
    pub exit_rx: oneshot::Receiver<i32>,
}

/// Spawn `program args..` under a fresh pty.
///
/// The child inherits the parent environment with `env` overlaid. Note the
/// pty collapses signal deaths into plain exit codes; callers that need
/// signal attribution must track the signals they themselves send.
pub async fn spawn_pty(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<SpawnedPty> {
    if program.is_empty() {
        anyhow::bail!("missing program for pty spawn");
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let mut command_builder = CommandBuilder::new(program);
    command_builder.cwd(cwd);
    for arg in args {
        command_builder.arg(arg);
    }
    for (key, value) in env {
        command_builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(command_builder)
        .with_context(|| format!("failed to spawn '{program}'"))?;
    let child_pid = child.process_id();
    let killer = child.clone_killer();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    let (output_tx, _) = broadcast::channel::<Vec<u8>>(256);

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    let output_tx_clone = output_tx.clone();
    let reader_handle: JoinHandle<()> = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = output_tx_clone.send(buf[..n].to_vec());
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    // Only the writer task touches the pty writer, so it owns it outright.
    let mut writer = pair
        .master
        .take_writer()
        .context("failed to take pty writer")?;
    let writer_handle: JoinHandle<()> = tokio::spawn(async move {
        use std::io::Write;
        while let Some(bytes) = writer_rx.recv().await {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    let exited = Arc::new(AtomicBool::new(false));
    let exit_code = Arc::new(StdMutex::new(None));
    let pid = Arc::new(StdMutex::new(child_pid));
    let wait_exited = Arc::clone(&exited);
    let wait_exit_code = Arc::clone(&exit_code);
    let wait_pid = Arc::clone(&pid);
    let wait_handle: JoinHandle<()> = tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        if let Ok(mut guard) = wait_exit_code.lock() {
            *guard = Some(code);
        }
        wait_exited.store(true, Ordering::SeqCst);
        // Clear the pid so drop cannot kill an unrelated recycled process.
        if let Ok(mut guard) = wait_pid.lock() {
            guard.take();
        }
        let _ = exit_tx.send(code);
    });

    let output_rx = output_tx.subscribe();
    let session = PtySession {
        writer_tx,
        output_tx,
        master: StdMutex::new(Some(pair.master)),
        killer: StdMutex::new(Some(killer)),
        reader_handle: StdMutex::new(Some(reader_handle)),
        writer_handle: StdMutex::new(Some(writer_handle)),
        wait_handle: StdMutex::new(Some(wait_handle)),
        exited,
        exit_code,
        pid,
    };

    Ok(SpawnedPty {
        session,
        output_rx,
        exit_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_output(rx: &mut broadcast::Receiver<Vec<u8>>, until: Duration) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + until;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Ok(chunk)) => collected.extend_from_slice(&chunk),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => break,
            }
        }
        collected
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn captures_output_and_exit_code() -> Result<()> {
        let mut spawned = spawn_pty(
            "/bin/bash",
            &["-c".to_string(), "echo ready; exit 7".to_string()],
            &std::env::current_dir()?,
            &HashMap::new(),
        )
        .await?;

        let output = collect_output(&mut spawned.output_rx, Duration::from_secs(2)).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("ready"), "missing child output: {text:?}");

        let code = spawned.exit_rx.await.unwrap_or(-1);
        assert_eq!(code, 7);
        assert!(spawned.session.has_exited());
        assert_eq!(spawned.session.exit_code(), Some(7));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stdin_reaches_the_child() -> Result<()> {
        let mut spawned = spawn_pty(
            "/bin/bash",
            &["-c".to_string(), "read line; echo \"got:$line\"".to_string()],
            &std::env::current_dir()?,
            &HashMap::new(),
        )
        .await?;

        spawned
            .session
            .writer_sender()
            .send(b"hello\n".to_vec())
            .await
            .map_err(|_| anyhow::anyhow!("writer channel closed"))?;

        let output = collect_output(&mut spawned.output_rx, Duration::from_secs(2)).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("got:hello"), "unexpected output: {text:?}");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_terminates_a_stubborn_child() -> Result<()> {
        let spawned = spawn_pty(
            "/bin/bash",
            &["-c".to_string(), "trap '' INT; sleep 30".to_string()],
            &std::env::current_dir()?,
            &HashMap::new(),
        )
        .await?;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!spawned.session.has_exited());

        spawned
            .session
            .kill()
            .map_err(|err| anyhow::anyhow!("kill failed: {err}"))?;

        let code = tokio::time::timeout(Duration::from_secs(5), spawned.exit_rx)
            .await
            .map_err(|_| anyhow::anyhow!("child did not exit after SIGKILL"))?
            .unwrap_or(-1);
        assert_ne!(code, 0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_kills_grandchildren() -> Result<()> {
        let bg_pid: i32;

        {
            let mut spawned = spawn_pty(
                "/bin/bash",
                &["-c".to_string(), "sleep 60 & echo $!; sleep 60".to_string()],
                &std::env::current_dir()?,
                &HashMap::new(),
            )
            .await?;

            let output = collect_output(&mut spawned.output_rx, Duration::from_secs(1)).await;
            let stdout = String::from_utf8_lossy(&output);
            let pid_line = stdout.lines().next().unwrap_or("").trim();
            bg_pid = pid_line.parse().map_err(|error| {
                anyhow::anyhow!("failed to parse pid from stdout '{pid_line}': {error}")
            })?;
            // SpawnedPty drops here, which triggers the process group kill.
        }

        let mut killed = false;
        for _ in 0..20 {
            if unsafe { libc::kill(bg_pid, 0) } == -1
                && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
            {
                killed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(killed, "grandchild process with pid {bg_pid} is still alive");
        Ok(())
    }
}
