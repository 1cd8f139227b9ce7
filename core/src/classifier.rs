//! Pure predicates over captured output lines.
//!
//! The classifier is built once per shell from the caller-supplied patterns
//! and applied to every line the buffer completes. It never touches shell
//! state; the state machine decides what a match means.

use regex_lite::Regex;

use crate::error::Result;
use crate::error::SupervisorError;

/// How many trailing lines the verification pattern is also tested against,
/// concatenated, to tolerate matches that span pty read fragments.
pub const RECENT_WINDOW_LINES: usize = 20;

const ERROR_PATTERN: &str = r"(?i)error|exception|fatal|panic";
const WARNING_PATTERN: &str = r"(?i)warn(ing)?";
const URL_PATTERN: &str = r"https?://\S+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotableKind {
    Error,
    Warning,
    Url,
    Prompt,
    Custom,
}

#[derive(Debug)]
pub struct EventClassifier {
    error_re: Regex,
    warning_re: Regex,
    url_re: Regex,
    notable: Option<Regex>,
    verification: Option<Regex>,
    verification_source: Option<String>,
}

impl EventClassifier {
    pub fn new(notable_pattern: Option<&str>, verification_pattern: Option<&str>) -> Result<Self> {
        Ok(Self {
            error_re: builtin(ERROR_PATTERN),
            warning_re: builtin(WARNING_PATTERN),
            url_re: builtin(URL_PATTERN),
            notable: notable_pattern.map(|p| compile_caller_pattern(p)).transpose()?,
            verification: verification_pattern
                .map(|p| compile_caller_pattern(p))
                .transpose()?,
            verification_source: verification_pattern.map(str::to_string),
        })
    }

    pub fn has_verification(&self) -> bool {
        self.verification.is_some()
    }

    pub fn verification_source(&self) -> Option<&str> {
        self.verification_source.as_deref()
    }

    /// Notable-event kinds matched by a single line. Prompt detection is not
    /// here: it needs quiescence, which only the scheduler can observe.
    pub fn classify(&self, line: &str) -> Vec<NotableKind> {
        let mut kinds = Vec::new();
        if self.error_re.is_match(line) {
            kinds.push(NotableKind::Error);
        }
        if self.warning_re.is_match(line) {
            kinds.push(NotableKind::Warning);
        }
        if self.url_re.is_match(line) {
            kinds.push(NotableKind::Url);
        }
        if let Some(notable) = &self.notable
            && notable.is_match(line)
        {
            kinds.push(NotableKind::Custom);
        }
        kinds
    }

    /// True when the verification pattern matches the line itself or the
    /// recent-lines concatenation.
    pub fn verification_matches(&self, line: &str, recent_window: &str) -> bool {
        match &self.verification {
            Some(re) => re.is_match(line) || re.is_match(recent_window),
            None => false,
        }
    }

    /// A line that may be an interactive prompt, pending the quiet check.
    pub fn is_prompt_candidate(line: &str) -> bool {
        let trimmed = line.trim_end();
        trimmed.ends_with(':') || trimmed.ends_with('?')
    }
}

fn builtin(pattern: &str) -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new(pattern).unwrap()
}

fn compile_caller_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|err| SupervisorError::BadArguments(format!("invalid pattern '{pattern}': {err}")))
}

/// Per-kind counters accumulated between polls, plus the first matching line
/// of each kind for the summary.
#[derive(Debug, Default, Clone)]
pub struct NotableEvents {
    pub errors: u32,
    pub warnings: u32,
    pub urls: u32,
    pub prompts: u32,
    pub custom_matches: u32,
    pub first_error: Option<String>,
    pub first_warning: Option<String>,
    pub first_url: Option<String>,
    pub first_prompt: Option<String>,
    pub first_custom: Option<String>,
}

impl NotableEvents {
    pub fn record(&mut self, kind: NotableKind, line: &str) {
        let (count, first) = match kind {
            NotableKind::Error => (&mut self.errors, &mut self.first_error),
            NotableKind::Warning => (&mut self.warnings, &mut self.first_warning),
            NotableKind::Url => (&mut self.urls, &mut self.first_url),
            NotableKind::Prompt => (&mut self.prompts, &mut self.first_prompt),
            NotableKind::Custom => (&mut self.custom_matches, &mut self.first_custom),
        };
        *count += 1;
        if first.is_none() {
            *first = Some(line.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors == 0
            && self.warnings == 0
            && self.urls == 0
            && self.prompts == 0
            && self.custom_matches == 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> EventClassifier {
        match EventClassifier::new(None, None) {
            Ok(c) => c,
            Err(e) => panic!("builtin classifier failed to build: {e}"),
        }
    }

    #[test]
    fn detects_errors_case_insensitively() {
        let c = classifier();
        assert_eq!(c.classify("Major Error Occurred! Code: 500"), vec![
            NotableKind::Error
        ]);
        assert_eq!(c.classify("PANIC: out of memory"), vec![NotableKind::Error]);
        assert_eq!(c.classify("unhandled exception in worker"), vec![
            NotableKind::Error
        ]);
        assert!(c.classify("all good").is_empty());
    }

    #[test]
    fn detects_warnings_and_urls() {
        let c = classifier();
        assert_eq!(c.classify("Minor Warning: config outdated"), vec![
            NotableKind::Warning
        ]);
        assert_eq!(
            c.classify("Found resource at http://localhost:8080/data"),
            vec![NotableKind::Url]
        );
    }

    #[test]
    fn one_line_can_match_several_kinds() {
        let c = classifier();
        assert_eq!(c.classify("error: see https://docs.test/warning"), vec![
            NotableKind::Error,
            NotableKind::Warning,
            NotableKind::Url
        ]);
    }

    #[test]
    fn custom_pattern_is_applied() {
        let c = match EventClassifier::new(Some("deploy complete"), None) {
            Ok(c) => c,
            Err(e) => panic!("classifier failed to build: {e}"),
        };
        assert_eq!(c.classify("deploy complete in 3s"), vec![NotableKind::Custom]);
    }

    #[test]
    fn bad_caller_pattern_is_rejected() {
        let err = match EventClassifier::new(Some("(unclosed"), None) {
            Ok(_) => panic!("expected a pattern error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "BadArguments");
    }

    #[test]
    fn verification_matches_line_or_window() {
        let c = match EventClassifier::new(None, Some("Server listening")) {
            Ok(c) => c,
            Err(e) => panic!("classifier failed to build: {e}"),
        };
        assert!(c.verification_matches("Server listening on :8080", ""));
        assert!(!c.verification_matches("booting", "still booting"));
        assert!(c.verification_matches("listening", "Server\nServer listening"));
    }

    #[test]
    fn prompt_candidates_end_with_colon_or_question_mark() {
        assert!(EventClassifier::is_prompt_candidate("Enter password:"));
        assert!(EventClassifier::is_prompt_candidate("Proceed? "));
        assert!(!EventClassifier::is_prompt_candidate("plain output"));
    }

    #[test]
    fn counters_track_first_matching_line() {
        let mut events = NotableEvents::default();
        assert!(events.is_empty());
        events.record(NotableKind::Error, "first error line");
        events.record(NotableKind::Error, "second error line");
        events.record(NotableKind::Url, "http://x.test");
        assert_eq!(events.errors, 2);
        assert_eq!(events.first_error.as_deref(), Some("first error line"));
        assert!(!events.is_empty());
        events.reset();
        assert!(events.is_empty());
    }
}
