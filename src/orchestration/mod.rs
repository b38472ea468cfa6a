/// Dependency graph with iterative topological ordering
pub mod graph;

/// Three-phase orchestration of registered initializers
pub mod state_manager;

pub use graph::DependencyGraph;
pub use state_manager::{ManagerOptions, StateManager};
