//! Pattern-based classification of free-text error messages
//!
//! Components register regular expressions; `detect_error` checks them in
//! registration order and records the first match in a per-component history,
//! optionally notifying a handler.

use crate::status::Timestamp;
use chrono::Utc;
use log::debug;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// One classified error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub component: String,
    pub message: String,
    /// Source text of the pattern that matched
    pub pattern: String,
    pub timestamp: Timestamp,
}

/// Callback invoked after an error has been recorded for a component
pub type ErrorHandler = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

#[derive(Default)]
struct DetectorState {
    patterns: HashMap<String, Vec<Regex>>,
    handlers: HashMap<String, ErrorHandler>,
    history: BTreeMap<String, Vec<ErrorRecord>>,
}

/// Shared error detector
#[derive(Clone, Default)]
pub struct ErrorDetector {
    state: Arc<Mutex<DetectorState>>,
}

impl std::fmt::Debug for ErrorDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ErrorDetector")
            .field("components", &state.patterns.keys().collect::<Vec<_>>())
            .field("recorded", &state.history.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl ErrorDetector {
    /// Create a detector with no patterns
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detector preloaded with common failure patterns per resource kind
    pub fn with_defaults() -> Self {
        let detector = Self::new();
        for (component, patterns) in default_patterns() {
            for pattern in patterns {
                // Built-in patterns are known to compile
                if let Err(e) = detector.register_pattern(component, pattern) {
                    log::error!("Invalid built-in pattern '{}': {}", pattern, e);
                }
            }
        }
        detector
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a regular expression for a component
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error if `pattern` is not a valid expression.
    pub fn register_pattern(&self, component: &str, pattern: &str) -> Result<(), regex::Error> {
        let regex = Regex::new(pattern)?;
        self.lock()
            .patterns
            .entry(component.to_string())
            .or_default()
            .push(regex);
        Ok(())
    }

    /// Give `component` the built-in patterns of resource kind `kind`
    ///
    /// Returns the number of patterns added; unknown kinds add none.
    pub fn register_defaults(&self, component: &str, kind: &str) -> usize {
        let mut added = 0;
        for (default_kind, patterns) in default_patterns() {
            if default_kind != kind {
                continue;
            }
            for pattern in patterns {
                if self.register_pattern(component, pattern).is_ok() {
                    added += 1;
                }
            }
        }
        added
    }

    /// Install the handler for a component, replacing any previous one
    pub fn set_handler<F>(&self, component: &str, handler: F)
    where
        F: Fn(&ErrorRecord) + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .insert(component.to_string(), Arc::new(handler));
    }

    pub fn pattern_count(&self, component: &str) -> usize {
        self.lock().patterns.get(component).map_or(0, Vec::len)
    }

    /// Classify a message
    ///
    /// Returns `true` and records the error if any registered pattern matches;
    /// returns `false` without recording anything otherwise.
    pub fn detect_error(&self, component: &str, message: &str) -> bool {
        let (record, handler) = {
            let mut state = self.lock();
            let matched = state
                .patterns
                .get(component)
                .and_then(|patterns| patterns.iter().find(|p| p.is_match(message)))
                .map(|p| p.as_str().to_string());

            let Some(pattern) = matched else {
                return false;
            };

            let record = ErrorRecord {
                component: component.to_string(),
                message: message.to_string(),
                pattern,
                timestamp: Utc::now(),
            };
            state
                .history
                .entry(component.to_string())
                .or_default()
                .push(record.clone());
            (record, state.handlers.get(component).cloned())
        };

        debug!(
            "Classified error for {} by pattern '{}'",
            component, record.pattern
        );

        // Lock released so handlers may query the detector
        if let Some(handler) = handler {
            handler(&record);
        }
        true
    }

    /// Recorded errors for one component, oldest first
    pub fn errors(&self, component: &str) -> Vec<ErrorRecord> {
        self.lock()
            .history
            .get(component)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_errors(&self) -> BTreeMap<String, Vec<ErrorRecord>> {
        self.lock().history.clone()
    }

    /// Forget recorded errors; patterns and handlers stay registered
    pub fn clear(&self) {
        self.lock().history.clear();
    }
}

fn default_patterns() -> Vec<(&'static str, Vec<&'static str>)> {
    let transport = [
        r"(?i)connection refused",
        r"(?i)timed? ?out",
        r"(?i)connection reset",
        r"(?i)no route to host",
        r"(?i)could not resolve|name or service not known|failed to lookup",
    ];
    let with = |extra: &[&'static str]| {
        let mut patterns = transport.to_vec();
        patterns.extend_from_slice(extra);
        patterns
    };

    vec![
        (
            "database",
            with(&[
                r"(?i)authentication failed|access denied",
                r"(?i)too many connections",
                r"(?i)database .* does not exist|unknown database",
            ]),
        ),
        (
            "cache",
            with(&[r"(?i)NOAUTH|WRONGPASS|invalid password", r"(?i)LOADING"]),
        ),
        (
            "queue",
            with(&[r"(?i)ACCESS_REFUSED|access refused", r"(?i)vhost .* not found"]),
        ),
        (
            "filesystem",
            vec![
                r"(?i)permission denied",
                r"(?i)not a directory",
                r"(?i)no such file or directory|does not exist",
                r"(?i)read-only file system",
                r"(?i)no space left on device",
            ],
        ),
        ("network", transport.to_vec()),
        (
            "external_api",
            with(&[r"\b5\d\d\b", r"\b429\b|(?i)too many requests"]),
        ),
    ]
}
