//! Paired start/end timing for initializer operations
//!
//! The performance monitor keys in-flight measurements by `(component, operation)`
//! and aggregates completed ones into count/total/min/max statistics. Handles are
//! cheap to clone and share one set of metrics, so the state manager and every
//! initializer it owns record into the same place.

use crate::error::MonitorError;
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Key identifying one measured operation
pub type MetricKey = (String, String);

/// Aggregated timings for one `(component, operation)` pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Every recorded duration in completion order
    pub durations: Vec<Duration>,
}

impl MetricRecord {
    fn first(duration: Duration) -> Self {
        Self {
            count: 1,
            total_duration: duration,
            min_duration: duration,
            max_duration: duration,
            durations: vec![duration],
        }
    }

    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.durations.push(duration);
    }

    /// Mean duration across all recorded measurements
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_duration.as_secs_f64() / self.count as f64)
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    in_flight: HashMap<MetricKey, Instant>,
    metrics: BTreeMap<MetricKey, MetricRecord>,
}

/// Shared performance monitor
#[derive(Debug, Clone, Default)]
pub struct PerformanceMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl PerformanceMonitor {
    /// Create a monitor with no recorded metrics
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the start of an operation
    ///
    /// Starting a key that is already in flight restarts its clock.
    pub fn start_measurement(&self, component: &str, operation: &str) {
        let key = (component.to_string(), operation.to_string());
        let mut state = self.lock();
        if state.in_flight.insert(key, Instant::now()).is_some() {
            warn!(
                "Restarting in-flight measurement for ({}, {})",
                component, operation
            );
        }
    }

    /// Finish an operation started with [`start_measurement`](Self::start_measurement)
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::NotStarted` when no measurement is in flight for the key.
    pub fn end_measurement(
        &self,
        component: &str,
        operation: &str,
    ) -> Result<Duration, MonitorError> {
        let key = (component.to_string(), operation.to_string());
        let mut state = self.lock();
        let started = state
            .in_flight
            .remove(&key)
            .ok_or_else(|| MonitorError::NotStarted {
                component: component.to_string(),
                operation: operation.to_string(),
            })?;

        let elapsed = started.elapsed();
        match state.metrics.get_mut(&key) {
            Some(record) => record.record(elapsed),
            None => {
                state.metrics.insert(key, MetricRecord::first(elapsed));
            }
        }

        debug!(
            "Measured ({}, {}) in {:?}",
            component, operation, elapsed
        );
        Ok(elapsed)
    }

    /// Time a closure under the given key
    pub fn measure<T>(&self, component: &str, operation: &str, f: impl FnOnce() -> T) -> T {
        let timer = Measurement::start(self.clone(), component, operation);
        let result = f();
        timer.finish();
        result
    }

    /// Whether a measurement is currently running for the key
    pub fn is_measuring(&self, component: &str, operation: &str) -> bool {
        self.lock()
            .in_flight
            .contains_key(&(component.to_string(), operation.to_string()))
    }

    /// Aggregated metrics for one key
    pub fn metric(&self, component: &str, operation: &str) -> Option<MetricRecord> {
        self.lock()
            .metrics
            .get(&(component.to_string(), operation.to_string()))
            .cloned()
    }

    /// Number of completed measurements for one key (0 if never measured)
    pub fn count(&self, component: &str, operation: &str) -> u64 {
        self.metric(component, operation)
            .map(|record| record.count)
            .unwrap_or(0)
    }

    /// Snapshot of every completed metric
    pub fn all_metrics(&self) -> BTreeMap<MetricKey, MetricRecord> {
        self.lock().metrics.clone()
    }

    /// Drop all recorded metrics and in-flight markers
    pub fn clear_metrics(&self) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.metrics.clear();
    }
}

/// Scoped measurement that records itself when finished or dropped
pub struct Measurement {
    monitor: PerformanceMonitor,
    component: String,
    operation: String,
    finished: bool,
}

impl Measurement {
    /// Start timing an operation
    pub fn start(monitor: PerformanceMonitor, component: &str, operation: &str) -> Self {
        monitor.start_measurement(component, operation);
        Self {
            monitor,
            component: component.to_string(),
            operation: operation.to_string(),
            finished: false,
        }
    }

    /// Finish timing and record the duration
    pub fn finish(mut self) -> Option<Duration> {
        self.record()
    }

    fn record(&mut self) -> Option<Duration> {
        if self.finished {
            return None;
        }
        self.finished = true;
        match self.monitor.end_measurement(&self.component, &self.operation) {
            Ok(elapsed) => Some(elapsed),
            Err(e) => {
                warn!("Measurement lost: {}", e);
                None
            }
        }
    }
}

impl Drop for Measurement {
    fn drop(&mut self) {
        self.record();
    }
}
