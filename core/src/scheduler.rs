//! Coarse periodic driver for every time-based transition.
//!
//! One loop ticks all non-terminal shells: verification deadlines, stop
//! grace/kill escalation, prompt settle, and exit polling. Keeping a single
//! mutator for time-driven transitions keeps their ordering deterministic.
//! A failure while ticking one shell crashes that shell only.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tracing::error;

use crate::config::SupervisorConfig;
use crate::registry::ShellRegistry;

pub(crate) fn spawn_scheduler(
    registry: Arc<ShellRegistry>,
    config: SupervisorConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for shell in registry.non_terminal() {
                if let Err(diagnostic) = shell.tick(now) {
                    error!(label = shell.label(), %diagnostic, "tick failed; crashing shell");
                    shell.mark_internal_crash(&diagnostic);
                }
            }
        }
    })
}
