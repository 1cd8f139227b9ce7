//! Composes the one-sentence `message` for a status snapshot.

use crate::classifier::NotableEvents;

/// Sentinel used when nothing notable happened between polls. A snapshot
/// carrying it also carries empty `logs`.
pub const NO_NOTABLE_EVENTS: &str = "no notable events";

/// One-shot note about a state transition that happened since the previous
/// poll. Consumed by the next snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionNote {
    Crashed {
        exit_code: Option<i32>,
        exit_signal: Option<i32>,
    },
    VerificationMatched {
        pattern: String,
    },
    VerificationTimedOut {
        timeout_ms: u64,
    },
}

/// First matching rule wins: crash, verification outcome, event counters,
/// then the sentinel.
pub fn compose_message(note: Option<&TransitionNote>, events: &NotableEvents) -> String {
    match note {
        Some(TransitionNote::Crashed {
            exit_code,
            exit_signal,
        }) => format!("shell crashed: exit={}", describe_exit(*exit_code, *exit_signal)),
        Some(TransitionNote::VerificationMatched { pattern }) => {
            format!("verification matched: {pattern}")
        }
        Some(TransitionNote::VerificationTimedOut { timeout_ms }) => {
            format!("verification timed out after {timeout_ms}ms; continuing")
        }
        None if !events.is_empty() => {
            let mut parts = Vec::new();
            if events.errors > 0 {
                parts.push(format!("{} error(s)", events.errors));
            }
            if events.warnings > 0 {
                parts.push(format!("{} warning(s)", events.warnings));
            }
            if events.urls > 0 {
                parts.push(format!("{} url(s)", events.urls));
            }
            if events.prompts > 0 {
                parts.push(format!("{} prompt(s)", events.prompts));
            }
            if events.custom_matches > 0 {
                parts.push(format!("{} notable match(es)", events.custom_matches));
            }
            format!("{} since last check", parts.join(", "))
        }
        None => NO_NOTABLE_EVENTS.to_string(),
    }
}

fn describe_exit(exit_code: Option<i32>, exit_signal: Option<i32>) -> String {
    match (exit_signal, exit_code) {
        (Some(signal), _) => format!("signal {signal}"),
        (None, Some(code)) => code.to_string(),
        (None, None) => "none".to_string(),
    }
}
