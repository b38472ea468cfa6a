use crate::error::MonitorError;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Summary statistics for one named metric series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Serialisable copy of everything a collector has accumulated
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectedData {
    pub metrics: BTreeMap<String, MetricSummary>,
    pub counters: BTreeMap<String, u64>,
    /// Completed timer durations in seconds
    pub timers: BTreeMap<String, Vec<f64>>,
    pub data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct CollectorState {
    series: BTreeMap<String, Vec<f64>>,
    counters: BTreeMap<String, u64>,
    running_timers: HashMap<String, Instant>,
    timers: BTreeMap<String, Vec<Duration>>,
    data: BTreeMap<String, serde_json::Value>,
}

/// Generic metric, timer and keyed-data accumulator
///
/// Not tied to any initializer; the state manager uses one per orchestration run
/// to record phase timings, outcome counters and the resolved execution order.
#[derive(Debug, Clone, Default)]
pub struct DataCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl DataCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a sample to a named series
    pub fn record_metric(&self, name: &str, value: f64) {
        self.lock()
            .series
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Increase a counter by one, returning the new value
    pub fn increment(&self, name: &str) -> u64 {
        self.add(name, 1)
    }

    /// Increase a counter by `amount`, returning the new value
    pub fn add(&self, name: &str, amount: u64) -> u64 {
        let mut state = self.lock();
        let counter = state.counters.entry(name.to_string()).or_insert(0);
        *counter += amount;
        *counter
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Start a named timer, restarting it if already running
    pub fn start_timer(&self, name: &str) {
        self.lock()
            .running_timers
            .insert(name.to_string(), Instant::now());
    }

    /// Stop a named timer and keep its duration
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::TimerNotStarted` if the timer is not running.
    pub fn stop_timer(&self, name: &str) -> Result<Duration, MonitorError> {
        let mut state = self.lock();
        let started = state
            .running_timers
            .remove(name)
            .ok_or_else(|| MonitorError::TimerNotStarted(name.to_string()))?;
        let elapsed = started.elapsed();
        state
            .timers
            .entry(name.to_string())
            .or_default()
            .push(elapsed);
        debug!("Timer '{}' stopped after {:?}", name, elapsed);
        Ok(elapsed)
    }

    /// Durations recorded for a timer, in completion order
    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.lock().timers.get(name).cloned().unwrap_or_default()
    }

    pub fn set_data(&self, key: &str, value: impl Into<serde_json::Value>) {
        self.lock().data.insert(key.to_string(), value.into());
    }

    pub fn data(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().data.get(key).cloned()
    }

    /// Statistics for a series, `None` if nothing was recorded under `name`
    pub fn summary(&self, name: &str) -> Option<MetricSummary> {
        self.lock().series.get(name).and_then(|values| summarize(values))
    }

    /// Copy out everything collected so far
    pub fn snapshot(&self) -> CollectedData {
        let state = self.lock();
        CollectedData {
            metrics: state
                .series
                .iter()
                .filter_map(|(name, values)| summarize(values).map(|s| (name.clone(), s)))
                .collect(),
            counters: state.counters.clone(),
            timers: state
                .timers
                .iter()
                .map(|(name, durations)| {
                    (
                        name.clone(),
                        durations.iter().map(Duration::as_secs_f64).collect(),
                    )
                })
                .collect(),
            data: state.data.clone(),
        }
    }

    /// Forget everything, including running timers
    pub fn clear(&self) {
        *self.lock() = CollectorState::default();
    }
}

fn summarize(values: &[f64]) -> Option<MetricSummary> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(MetricSummary {
        count: values.len(),
        sum,
        min,
        max,
        avg: sum / values.len() as f64,
    })
}
