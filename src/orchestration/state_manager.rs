use crate::collectors::DataCollector;
use crate::detection::ErrorDetector;
use crate::error::{ConnectionError, InitError};
use crate::initializer::Initializer;
use crate::monitoring::PerformanceMonitor;
use crate::orchestration::DependencyGraph;
use crate::status::Status;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::thread;

/// Policy switches for a [`StateManager`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Reset already initialized resources, newest first, when a later one fails
    pub rollback_on_failure: bool,
    /// Run connection tests on scoped threads instead of one after another
    pub parallel_connection_tests: bool,
}

/// Orchestrates a set of initializers through the three lifecycle phases
///
/// The execution order is resolved from the declared dependencies before any
/// phase runs. Validation and connection testing are all-or-nothing: the first
/// failure aborts the run before resources are touched.
///
/// # Example
/// ```
/// use preflight::initializers::FileSystemInitializer;
/// use preflight::orchestration::StateManager;
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut config = toml::Table::new();
/// config.insert("base_path".into(), dir.path().display().to_string().into());
/// config.insert("required_dirs".into(), vec!["cache".to_string()].into());
///
/// let mut manager = StateManager::new();
/// manager.register(Box::new(FileSystemInitializer::new("storage", config))).unwrap();
/// manager.initialize().unwrap();
/// assert!(manager.is_initialized());
/// ```
pub struct StateManager {
    initializers: Vec<Box<dyn Initializer>>,
    execution_order: Vec<String>,
    status: Status,
    monitor: PerformanceMonitor,
    detector: ErrorDetector,
    collector: DataCollector,
    options: ManagerOptions,
    initialized: bool,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self::with_options(ManagerOptions::default())
    }

    pub fn with_options(options: ManagerOptions) -> Self {
        Self {
            initializers: Vec::new(),
            execution_order: Vec::new(),
            status: Status::new(),
            monitor: PerformanceMonitor::new(),
            detector: ErrorDetector::with_defaults(),
            collector: DataCollector::new(),
            options,
            initialized: false,
        }
    }

    pub fn options(&self) -> ManagerOptions {
        self.options
    }

    /// Add an initializer, sharing the manager's monitor and detector with it
    ///
    /// # Errors
    ///
    /// `InitError::DuplicateInitializer` if the name is taken.
    pub fn register(&mut self, mut initializer: Box<dyn Initializer>) -> Result<(), InitError> {
        let name = initializer.name().to_string();
        if self.index_of(&name).is_some() {
            return Err(InitError::DuplicateInitializer(name));
        }
        if self.detector.pattern_count(&name) == 0 {
            self.detector.register_defaults(&name, initializer.kind());
        }
        initializer
            .lifecycle_mut()
            .attach(self.monitor.clone(), self.detector.clone());
        debug!(
            "Registered {} initializer '{}' (depends on: {:?})",
            initializer.kind(),
            name,
            initializer.dependencies()
        );
        self.initializers.push(initializer);
        self.execution_order.clear();
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.initializers.iter().position(|i| i.name() == name)
    }

    /// Resolve the dependency order without running anything
    pub fn resolve_order(&self) -> Result<Vec<String>, InitError> {
        let mut graph = DependencyGraph::new();
        for initializer in &self.initializers {
            graph.add_node(initializer.name());
        }
        for initializer in &self.initializers {
            for dependency in initializer.dependencies() {
                graph.add_edge(initializer.name(), dependency);
            }
        }
        graph.resolve()
    }

    /// Resolve the order and store it; indices follow the resolved order
    fn prepare(&mut self) -> Result<Vec<usize>, InitError> {
        let order = self.resolve_order()?;
        let indices = order
            .iter()
            .filter_map(|name| self.index_of(name))
            .collect();
        info!("Execution order: {}", order.join(" -> "));
        self.collector.set_data("execution_order", order.clone());
        self.execution_order = order;
        Ok(indices)
    }

    /// Run every lifecycle phase across all initializers
    ///
    /// A second call after success is a no-op.
    ///
    /// # Errors
    ///
    /// Cycle and unknown-dependency errors are returned before any initializer
    /// runs. Phase failures come back as `InitError::Phase` naming the component.
    pub fn initialize(&mut self) -> Result<(), InitError> {
        if self.initialized {
            debug!("Already initialized; nothing to do");
            return Ok(());
        }

        self.status.reset();
        self.status.start();

        let order = match self.prepare() {
            Ok(order) => order,
            Err(e) => return Err(self.abort(e)),
        };

        if let Err(e) = self.validate_phase(&order) {
            return Err(self.abort(e));
        }
        if let Err(e) = self.connect_phase(&order) {
            return Err(self.abort(e));
        }
        if let Err(e) = self.perform_phase(&order) {
            return Err(self.abort(e));
        }

        self.initialized = true;
        self.status.add_data("initializers", self.initializers.len());
        self.status.mark_initialized();
        self.status.mark_complete();
        info!("All {} initializers complete", self.initializers.len());
        Ok(())
    }

    /// Resolve the order and validate every configuration, without I/O
    pub fn validate(&mut self) -> Result<(), InitError> {
        let order = self.prepare()?;
        self.validate_phase(&order)
    }

    fn abort(&mut self, err: InitError) -> InitError {
        error!("Initialization aborted: {}", err);
        if let InitError::Phase {
            component, phase, ..
        } = &err
        {
            self.status.add_data("failed_component", component.as_str());
            self.status.add_data("failed_phase", *phase);
        }
        self.status.mark_failed(err.to_string());
        err
    }

    fn phase_error(component: &str, phase: &'static str, source: InitError) -> InitError {
        InitError::Phase {
            component: component.to_string(),
            phase,
            source: Box::new(source),
        }
    }

    fn validate_phase(&mut self, order: &[usize]) -> Result<(), InitError> {
        info!("Phase 1/3: validating {} configurations", order.len());
        self.collector.start_timer("phase.validate");
        let result = order.iter().try_for_each(|&i| {
            let initializer = &mut self.initializers[i];
            initializer.validate_configuration().map_err(|e| {
                Self::phase_error(initializer.name(), "validate", e.into())
            })
        });
        self.stop_timer("phase.validate");
        if result.is_err() {
            self.collector.increment("initializers.failed");
        }
        result
    }

    fn connect_phase(&mut self, order: &[usize]) -> Result<(), InitError> {
        info!(
            "Phase 2/3: testing {} connections{}",
            order.len(),
            if self.options.parallel_connection_tests {
                " in parallel"
            } else {
                ""
            }
        );
        self.collector.start_timer("phase.connect");

        let result = if self.options.parallel_connection_tests {
            let mut outcomes = self.test_in_parallel();
            order.iter().try_for_each(|&i| {
                let outcome = outcomes[i].take().unwrap_or_else(|| {
                    Err(InitError::NotValidated(
                        self.initializers[i].name().to_string(),
                    ))
                });
                Self::check_connection(self.initializers[i].as_ref(), outcome)
            })
        } else {
            order.iter().try_for_each(|&i| {
                let outcome = self.initializers[i].test_connection();
                Self::check_connection(self.initializers[i].as_ref(), outcome)
            })
        };

        self.stop_timer("phase.connect");
        if result.is_err() {
            self.collector.increment("initializers.failed");
        }
        result
    }

    /// Run every connection test on its own scoped thread, keyed by registration index
    fn test_in_parallel(&mut self) -> Vec<Option<Result<bool, InitError>>> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .initializers
                .iter_mut()
                .map(|initializer| scope.spawn(move || initializer.test_connection()))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(outcome) => Some(outcome),
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    fn check_connection(
        initializer: &dyn Initializer,
        outcome: Result<bool, InitError>,
    ) -> Result<(), InitError> {
        let name = initializer.name();
        match outcome {
            Ok(true) => {
                debug!("{}: connection test passed", name);
                Ok(())
            }
            Ok(false) => {
                let cause = initializer
                    .lifecycle()
                    .last_connection_error()
                    .cloned()
                    .unwrap_or_else(|| ConnectionError {
                        component: name.to_string(),
                        target: name.to_string(),
                        attempts: 0,
                        last_error: "connection test failed".to_string(),
                    });
                Err(Self::phase_error(name, "connect", cause.into()))
            }
            Err(e) => Err(Self::phase_error(name, "connect", e)),
        }
    }

    fn perform_phase(&mut self, order: &[usize]) -> Result<(), InitError> {
        info!("Phase 3/3: initializing {} resources", order.len());
        self.collector.start_timer("phase.perform");

        let mut done: Vec<usize> = Vec::with_capacity(order.len());
        let mut result = Ok(());
        for &i in order {
            let initializer = &mut self.initializers[i];
            match initializer.perform_initialization() {
                Ok(()) => {
                    self.collector.increment("initializers.succeeded");
                    done.push(i);
                }
                Err(e) => {
                    self.collector.increment("initializers.failed");
                    result = Err(Self::phase_error(initializer.name(), "perform", e));
                    break;
                }
            }
        }

        if result.is_err() && self.options.rollback_on_failure {
            for &i in done.iter().rev() {
                let initializer = &mut self.initializers[i];
                warn!("Rolling back '{}'", initializer.name());
                initializer.reset();
            }
        }

        self.stop_timer("phase.perform");
        result
    }

    fn stop_timer(&self, name: &str) {
        match self.collector.stop_timer(name) {
            Ok(elapsed) => debug!("{} took {:?}", name, elapsed),
            Err(e) => warn!("{}", e),
        }
    }

    /// Tear every initializer down, newest first, and allow a fresh run
    pub fn reset(&mut self) {
        let order: Vec<usize> = if self.execution_order.is_empty() {
            (0..self.initializers.len()).collect()
        } else {
            self.execution_order
                .iter()
                .filter_map(|name| self.index_of(name))
                .collect()
        };
        for i in order.into_iter().rev() {
            self.initializers[i].reset();
        }
        self.status.reset();
        self.initialized = false;
        info!("State manager reset");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Aggregate status of the last run
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Names in resolved order; empty until a run or validation resolved it
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Every initializer's status, in execution order when known
    pub fn statuses(&self) -> Vec<(&str, &Status)> {
        let mut entries: Vec<(&str, &Status)> = Vec::with_capacity(self.initializers.len());
        for name in &self.execution_order {
            if let Some(i) = self.index_of(name) {
                entries.push((self.initializers[i].name(), self.initializers[i].status()));
            }
        }
        for initializer in &self.initializers {
            if !entries.iter().any(|(name, _)| *name == initializer.name()) {
                entries.push((initializer.name(), initializer.status()));
            }
        }
        entries
    }

    pub fn get(&self, name: &str) -> Option<&dyn Initializer> {
        self.index_of(name).map(|i| self.initializers[i].as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn Initializer> {
        let i = self.index_of(name)?;
        let initializer: &mut dyn Initializer = self.initializers[i].as_mut();
        Some(initializer)
    }

    pub fn len(&self) -> usize {
        self.initializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty()
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn detector(&self) -> &ErrorDetector {
        &self.detector
    }

    pub fn collector(&self) -> &DataCollector {
        &self.collector
    }
}
