use std::time::Duration;

/// Overrides the default per-shell log buffer capacity (integer ≥ 1).
pub const MAX_LOG_LINES_ENV: &str = "MCP_MAX_LOG_LINES";
/// Test mode: shortens verification and settle waits to sub-second values.
pub const FAST_MODE_ENV: &str = "MCP_PM_FAST";

pub const DEFAULT_MAX_LOG_LINES: usize = 500;
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Timing and capacity knobs for a supervisor instance.
///
/// Tests construct these directly so each supervisor is fully isolated; the
/// server binary goes through [`SupervisorConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Ring buffer capacity in lines, per shell.
    pub max_log_lines: usize,
    /// Hard per-line byte cap; longer lines are split.
    pub max_line_bytes: usize,
    /// Default deadline for verification-pattern matching.
    pub verification_timeout: Duration,
    /// Pty quiescence window used by the post-input settle wait.
    pub quiet_window: Duration,
    /// Quiet period after a `:`/`?` line before it counts as a prompt.
    pub prompt_quiet: Duration,
    /// Upper bound on the synchronous wait inside `send_input`.
    pub input_settle: Duration,
    /// Time between the graceful interrupt and SIGKILL escalation.
    pub grace: Duration,
    /// Time after SIGKILL before an unobserved exit is reaped as a zombie.
    pub kill_wait: Duration,
    /// Scheduler tick period.
    pub tick_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            max_line_bytes: MAX_LINE_BYTES,
            verification_timeout: Duration::from_millis(30_000),
            quiet_window: Duration::from_millis(500),
            prompt_quiet: Duration::from_millis(100),
            input_settle: Duration::from_millis(1_500),
            grace: Duration::from_millis(3_000),
            kill_wait: Duration::from_millis(2_000),
            tick_interval: Duration::from_millis(250),
        }
    }
}

impl SupervisorConfig {
    /// Sub-second waits for test runs.
    pub fn fast() -> Self {
        Self {
            verification_timeout: Duration::from_millis(800),
            quiet_window: Duration::from_millis(150),
            prompt_quiet: Duration::from_millis(100),
            input_settle: Duration::from_millis(400),
            grace: Duration::from_millis(500),
            kill_wait: Duration::from_millis(500),
            tick_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let mut config = if env_flag(FAST_MODE_ENV) {
            Self::fast()
        } else {
            Self::default()
        };
        if let Ok(raw) = std::env::var(MAX_LOG_LINES_ENV)
            && let Ok(lines) = raw.trim().parse::<usize>()
        {
            config.max_log_lines = lines.max(1);
        }
        config
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.max_log_lines, 500);
        assert_eq!(config.verification_timeout, Duration::from_millis(30_000));
        assert_eq!(config.grace, Duration::from_millis(3_000));
    }

    #[test]
    fn fast_mode_keeps_capacity_but_shortens_waits() {
        let config = SupervisorConfig::fast();
        assert_eq!(config.max_log_lines, 500);
        assert!(config.verification_timeout < Duration::from_secs(1));
        assert!(config.input_settle < Duration::from_secs(1));
    }
}
