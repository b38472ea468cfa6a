//! Per-initializer state machine and diagnostic record
//!
//! A `Status` tracks where an initializer is in its lifecycle together with an
//! unstructured bag of diagnostic data, errors and warnings. `StatusReport` is the
//! external, serialisable view consumed by the health-check binary.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the crate
pub type Timestamp = DateTime<Utc>;

/// Lifecycle states of an initializer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Constructed or reset, nothing attempted yet
    Pending,
    /// A lifecycle phase is running
    Initializing,
    /// Resource handle acquired
    Initialized,
    /// Lifecycle finished successfully
    Complete,
    /// Errors were recorded but the run has not been marked failed
    Error,
    /// Lifecycle aborted
    Failed,
}

impl State {
    /// `complete` and `failed` only leave through `reset`
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Initializing => "initializing",
            State::Initialized => "initialized",
            State::Complete => "complete",
            State::Error => "error",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine plus diagnostics owned by one initializer (or the manager's run)
#[derive(Debug, Clone)]
pub struct Status {
    state: State,
    data: BTreeMap<String, serde_json::Value>,
    errors: Vec<String>,
    warnings: Vec<String>,
    dependencies: Vec<String>,
    started_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
    /// Sticky once `mark_failed` ran; cleared only by `reset`
    failed: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    /// Create a pending status; timing starts now
    pub fn new() -> Self {
        Self {
            state: State::Pending,
            data: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            dependencies: Vec::new(),
            started_at: Some(Utc::now()),
            ended_at: None,
            failed: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Enter `initializing`
    ///
    /// Allowed from `pending`, `error` and `initialized`. Terminal states are left
    /// untouched and `false` is returned.
    pub fn start(&mut self) -> bool {
        match self.state {
            State::Complete | State::Failed => {
                warn!(
                    "Ignoring start on terminal status '{}'; reset required",
                    self.state
                );
                false
            }
            _ => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.state = State::Initializing;
                true
            }
        }
    }

    /// Record that the resource handle has been acquired
    pub fn mark_initialized(&mut self) {
        if matches!(self.state, State::Pending | State::Initializing) {
            self.state = State::Initialized;
        } else {
            debug!("mark_initialized ignored in state '{}'", self.state);
        }
    }

    /// Finish the lifecycle successfully
    pub fn mark_complete(&mut self) {
        match self.state {
            State::Initializing | State::Initialized => {
                self.state = State::Complete;
                self.ended_at = Some(Utc::now());
            }
            other => warn!("mark_complete ignored in state '{}'", other),
        }
    }

    /// Abort the lifecycle, recording `reason` as an error
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.state == State::Complete {
            warn!("mark_failed ignored on complete status; reset required");
            return;
        }
        self.errors.push(reason.into());
        self.state = State::Failed;
        self.failed = true;
        self.ended_at = Some(Utc::now());
    }

    /// Append an error
    ///
    /// `pending`, `initializing` and `initialized` move to `error`; `failed` is
    /// never downgraded and `complete` keeps its state.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        if matches!(
            self.state,
            State::Pending | State::Initializing | State::Initialized
        ) {
            self.state = State::Error;
        }
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record a piece of diagnostic data; a later value for the same key wins
    pub fn add_data(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Declare a prerequisite; duplicates are ignored
    pub fn add_dependency(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
    }

    /// Return to `pending`, clearing data, errors, warnings and timestamps
    ///
    /// Declared dependencies are structural and survive a reset.
    pub fn reset(&mut self) {
        self.state = State::Pending;
        self.data.clear();
        self.errors.clear();
        self.warnings.clear();
        self.started_at = None;
        self.ended_at = None;
        self.failed = false;
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, State::Complete | State::Initialized)
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    pub fn has_errors(&self) -> bool {
        self.failed || !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<Timestamp> {
        self.ended_at
    }

    /// Elapsed time between start and end, once both are recorded
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Snapshot in the external representation
    pub fn to_report(&self) -> StatusReport {
        StatusReport {
            status: self.state,
            data: self.data.clone(),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            duration: self
                .duration()
                .map(|d| d.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0),
            has_errors: self.has_errors(),
            has_warnings: self.has_warnings(),
        }
    }
}

/// Read-only external view of a `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: State,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Seconds between start and end, `null` while still running
    pub duration: Option<f64>,
    #[serde(rename = "hasErrors")]
    pub has_errors: bool,
    #[serde(rename = "hasWarnings")]
    pub has_warnings: bool,
}

impl StatusReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, State::Complete | State::Initialized)
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

impl From<&Status> for StatusReport {
    fn from(status: &Status) -> Self {
        status.to_report()
    }
}
