//! The lifecycle contract shared by every resource initializer
//!
//! An initializer brings one backend resource up in three ordered steps:
//! validate its configuration, test connectivity, then perform the idempotent
//! setup and hold the resulting handle. The shared bookkeeping (status, timing,
//! retries, error classification) lives in [`Lifecycle`], which each concrete
//! initializer owns rather than inherits.

use crate::detection::ErrorDetector;
use crate::error::{ConfigurationError, ConnectionError, InitError};
use crate::monitoring::{Measurement, PerformanceMonitor};
use crate::status::Status;
use log::{debug, error, info, warn};
use std::fmt;
use std::thread;
use std::time::Duration;

/// Typed accessors over configuration maps
pub mod settings;

/// Operation name under which connection attempts are measured
pub const CONNECTION_OPERATION: &str = "connection";

/// Operation name under which the perform phase is measured
pub const INITIALIZATION_OPERATION: &str = "initialization";

/// Bounded retry-with-delay policy for connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one
    pub attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Status, timing and retry bookkeeping owned by one initializer
pub struct Lifecycle {
    name: String,
    status: Status,
    monitor: PerformanceMonitor,
    detector: ErrorDetector,
    validated: bool,
    last_connection_error: Option<ConnectionError>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.status.state())
            .field("validated", &self.validated)
            .finish()
    }
}

impl Lifecycle {
    /// Create the bookkeeping for an initializer named `name` of resource `kind`
    ///
    /// The initializer gets private monitor and detector instances until a state
    /// manager attaches its shared ones. The private detector carries the default
    /// patterns of `kind` under `name`.
    pub fn new(name: impl Into<String>, kind: &str) -> Self {
        let name = name.into();
        let detector = ErrorDetector::new();
        detector.register_defaults(&name, kind);
        Self {
            name,
            status: Status::new(),
            monitor: PerformanceMonitor::new(),
            detector,
            validated: false,
            last_connection_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn detector(&self) -> &ErrorDetector {
        &self.detector
    }

    /// Share a monitor and detector with other initializers
    pub fn attach(&mut self, monitor: PerformanceMonitor, detector: ErrorDetector) {
        self.monitor = monitor;
        self.detector = detector;
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// The `ConnectionError` from the most recent exhausted connection test
    pub fn last_connection_error(&self) -> Option<&ConnectionError> {
        self.last_connection_error.as_ref()
    }

    /// Record the outcome of configuration validation
    ///
    /// Failures are recorded as status errors and handed back for propagation.
    pub fn record_validation(
        &mut self,
        result: Result<(), ConfigurationError>,
    ) -> Result<(), ConfigurationError> {
        match result {
            Ok(()) => {
                self.validated = true;
                debug!("{}: configuration valid", self.name);
                Ok(())
            }
            Err(e) => {
                self.validated = false;
                error!("{}: {}", self.name, e);
                self.status.add_error(format!("ConfigurationError: {}", e));
                Err(e)
            }
        }
    }

    /// Fail with `NotValidated` unless validation succeeded
    pub fn ensure_validated(&self) -> Result<(), InitError> {
        if self.validated {
            Ok(())
        } else {
            Err(InitError::NotValidated(self.name.clone()))
        }
    }

    /// Run `attempt` under `policy`, sleeping between failures
    ///
    /// Each attempt is measured as `(name, "connection")` and every failure message
    /// is offered to the error detector. When all attempts fail, a
    /// `ConnectionError` is recorded in the status and returned.
    pub fn connect_with_retry<T, E>(
        &mut self,
        target: &str,
        policy: RetryPolicy,
        attempt: impl FnMut() -> Result<T, E>,
    ) -> Result<T, ConnectionError>
    where
        E: fmt::Display,
    {
        self.retry(target, policy, attempt).map_err(|err| {
            self.record_connection_error(err.clone());
            err
        })
    }

    /// Record an exhausted connection test in the status
    pub fn record_connection_error(&mut self, err: ConnectionError) {
        self.status.add_error(err.to_string());
        self.last_connection_error = Some(err);
    }

    /// Same as [`Lifecycle::connect_with_retry`] but leaves the status errors alone
    ///
    /// Used inside [`Lifecycle::perform`], whose failure path records the error.
    pub fn retry<T, E>(
        &mut self,
        target: &str,
        policy: RetryPolicy,
        mut attempt: impl FnMut() -> Result<T, E>,
    ) -> Result<T, ConnectionError>
    where
        E: fmt::Display,
    {
        let mut last_error = String::new();

        for n in 1..=policy.attempts {
            debug!(
                "{}: connection attempt {}/{} to {}",
                self.name, n, policy.attempts, target
            );
            let timer = Measurement::start(self.monitor.clone(), &self.name, CONNECTION_OPERATION);
            let result = attempt();
            timer.finish();

            match result {
                Ok(value) => {
                    self.status.add_data("connection_attempts", n);
                    self.last_connection_error = None;
                    if n > 1 {
                        info!("{}: connected to {} after {} attempts", self.name, target, n);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "{}: attempt {}/{} to {} failed: {}",
                        self.name, n, policy.attempts, target, last_error
                    );
                    self.classify(&last_error);
                    if n < policy.attempts && !policy.delay.is_zero() {
                        thread::sleep(policy.delay);
                    }
                }
            }
        }

        let err = ConnectionError {
            component: self.name.clone(),
            target: target.to_string(),
            attempts: policy.attempts,
            last_error,
        };
        error!("{}: {}", self.name, err);
        self.status.add_data("connection_attempts", policy.attempts);
        self.last_connection_error = Some(err.clone());
        Err(err)
    }

    /// Offer a failure message to the detector, noting a classification as a warning
    pub fn classify(&mut self, message: &str) {
        if self.detector.detect_error(&self.name, message) {
            self.status.add_warning(format!("classified: {}", message));
        }
    }

    /// Run the perform phase body with status and timing bookkeeping
    ///
    /// The status enters `initializing`; success marks it complete, failure marks it
    /// failed with the error message and hands the error back.
    pub fn perform<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, InitError>,
    ) -> Result<T, InitError> {
        self.ensure_validated()?;
        if self.status.state().is_terminal() {
            debug!("{}: starting a new run from '{}'", self.name, self.status.state());
            self.status.reset();
        }
        self.status.start();
        info!("{}: performing initialization", self.name);

        let timer = Measurement::start(
            self.monitor.clone(),
            &self.name,
            INITIALIZATION_OPERATION,
        );
        let result = body(self);
        timer.finish();

        match result {
            Ok(value) => {
                self.status.mark_initialized();
                self.status.mark_complete();
                info!("{}: initialization complete", self.name);
                Ok(value)
            }
            Err(e) => {
                error!("{}: initialization failed: {}", self.name, e);
                // Connection failures were classified attempt by attempt
                if !matches!(e.root(), InitError::Connection(_)) {
                    self.classify(&e.to_string());
                }
                self.status.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Return the status to `pending` and forget the last connection error
    ///
    /// Validation survives; the configuration has not changed.
    pub fn reset(&mut self) {
        self.status.reset();
        self.last_connection_error = None;
    }
}

/// Capability interface implemented by each resource initializer
///
/// The three lifecycle operations are meant to run in order, once per run.
/// Validation never performs I/O. `test_connection` reports an unreachable
/// resource as `Ok(false)` after exhausting its retries, keeping the
/// `ConnectionError` in the lifecycle; errors are reserved for misuse.
pub trait Initializer: Send {
    fn lifecycle(&self) -> &Lifecycle;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    /// Resource kind (`"database"`, `"cache"`, ...)
    fn kind(&self) -> &'static str;

    /// Check the configuration map and keep the parsed settings
    fn validate_configuration(&mut self) -> Result<(), ConfigurationError>;

    /// Attempt to reach the resource using the validated settings
    fn test_connection(&mut self) -> Result<bool, InitError>;

    /// Perform the setup proper to the resource and keep its handle
    fn perform_initialization(&mut self) -> Result<(), InitError>;

    /// Release any held handle and return the status to `pending`
    fn reset(&mut self);

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn status(&self) -> &Status {
        self.lifecycle().status()
    }

    fn dependencies(&self) -> &[String] {
        self.lifecycle().status().dependencies()
    }

    /// Declare that this initializer must run after `name`
    fn depends_on(&mut self, name: &str) {
        self.lifecycle_mut().status_mut().add_dependency(name);
    }
}
