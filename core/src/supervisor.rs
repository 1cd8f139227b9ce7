//! Supervisor facade: the registry, the scheduler, and the five operations
//! the control plane binds tools to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::sleep;
use tracing::info;
use tracing::warn;

use shellherd_utils_pty::spawn_pty;

use crate::classifier::EventClassifier;
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::registry::ShellRegistry;
use crate::scheduler::spawn_scheduler;
use crate::shell::ManagedShell;
use crate::shell::ShellListEntry;
use crate::shell::ShellSnapshot;

pub const DEFAULT_CHECK_LOG_LINES: usize = 50;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Launch descriptor accepted by `start_shell`. Deserialized straight from
/// the tool-call arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct StartShellParams {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(rename = "workingDirectory", default)]
    pub working_directory: Option<PathBuf>,

    pub label: String,

    #[serde(default)]
    pub verification_pattern: Option<String>,

    #[serde(default)]
    pub verification_timeout_ms: Option<u64>,

    #[serde(default)]
    pub notable_pattern: Option<String>,

    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// Owns every managed shell. Instances are independent, so tests can run
/// several supervisors side by side.
pub struct ShellSupervisor {
    config: SupervisorConfig,
    registry: Arc<ShellRegistry>,
    scheduler: StdMutex<Option<JoinHandle<()>>>,
}

impl ShellSupervisor {
    /// Requires a tokio runtime: the scheduler starts immediately.
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let registry = Arc::new(ShellRegistry::new());
        let scheduler = spawn_scheduler(Arc::clone(&registry), config.clone());
        Arc::new(Self {
            config,
            registry,
            scheduler: StdMutex::new(Some(scheduler)),
        })
    }

    /// Register and launch a shell. The label is claimed before the spawn,
    /// so a concurrent duplicate start never reaches the pty. A spawn
    /// failure still returns a snapshot: the caller owns a (crashed,
    /// addressable) record either way.
    pub async fn start_shell(&self, params: StartShellParams) -> Result<ShellSnapshot> {
        let StartShellParams {
            command,
            args,
            working_directory,
            label,
            verification_pattern,
            verification_timeout_ms,
            notable_pattern,
            env,
        } = params;

        if label.trim().is_empty() {
            return Err(SupervisorError::BadArguments(
                "label must not be empty".to_string(),
            ));
        }
        if command.trim().is_empty() {
            return Err(SupervisorError::BadArguments(
                "command must not be empty".to_string(),
            ));
        }

        let classifier = EventClassifier::new(
            notable_pattern.as_deref(),
            verification_pattern.as_deref(),
        )?;
        let verify_timeout_ms = verification_timeout_ms
            .unwrap_or(self.config.verification_timeout.as_millis() as u64);

        let command_line = std::iter::once(command.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let shell = Arc::new(ManagedShell::new(
            label.clone(),
            command_line,
            classifier,
            verify_timeout_ms,
            self.config.clone(),
        ));
        self.registry.insert(Arc::clone(&shell))?;

        let cwd = match working_directory {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        let env = env.unwrap_or_default();

        match spawn_pty(&command, &args, &cwd, &env).await {
            Ok(spawned) => {
                info!(label = %label, command = %command, "shell started");
                shell.attach(spawned);
            }
            Err(err) => {
                warn!(label = %label, command = %command, error = %err, "shell spawn failed");
                shell.mark_spawn_failed(&format!("{err:#}"));
            }
        }

        Ok(shell.snapshot_now(DEFAULT_CHECK_LOG_LINES))
    }

    /// Consuming poll. A terminal shell whose stop was requested is removed
    /// once this snapshot hands the terminal status to the caller.
    pub async fn check_shell(&self, label: &str, log_lines: usize) -> Result<ShellSnapshot> {
        let shell = self.registry.get(label)?;
        let snapshot = shell.check(log_lines);
        if snapshot.status.is_terminal() && shell.stop_requested() {
            self.registry.remove(label);
        }
        Ok(snapshot)
    }

    pub async fn send_input(
        &self,
        label: &str,
        input: &str,
        append_newline: bool,
    ) -> Result<ShellSnapshot> {
        let shell = self.registry.get(label)?;
        shell.send_input(input, append_newline).await
    }

    pub async fn stop_shell(&self, label: &str, force: bool) -> Result<ShellSnapshot> {
        let shell = self.registry.get(label)?;
        Ok(shell.stop(force))
    }

    pub async fn list_shells(&self) -> Vec<ShellListEntry> {
        let mut shells = self.registry.list();
        shells.sort_by_key(|shell| shell.started_at());
        shells.iter().map(|shell| shell.list_entry()).collect()
    }

    /// Force-stop everything. Called on transport EOF; waits (bounded) for
    /// exits so children do not outlive the supervisor.
    pub async fn shutdown(&self) {
        let shells = self.registry.list();
        if !shells.is_empty() {
            info!(count = shells.len(), "shutting down managed shells");
        }
        for shell in &shells {
            shell.stop(true);
        }

        let deadline = tokio::time::Instant::now() + self.config.kill_wait;
        while tokio::time::Instant::now() < deadline {
            if self.registry.non_terminal().is_empty() {
                break;
            }
            sleep(SHUTDOWN_POLL).await;
        }

        // Dropping the shells tears down ptys and process groups.
        for shell in shells {
            self.registry.remove(shell.label());
        }
    }
}

impl Drop for ShellSupervisor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.scheduler.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ShellSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSupervisor")
            .field("shells", &self.registry.len())
            .finish()
    }
}
