/// Error taxonomy for initializers, drivers and the bootstrap file
pub mod error;

/// Per-initializer state machine and its external report
pub mod status;

/// Paired start/end timing of initializer operations
pub mod monitoring;

/// Generic metric, timer and keyed-data accumulation
pub mod collectors;

/// Pattern-based error classification
pub mod detection;

/// Socket, RESP and in-process resource drivers
pub mod drivers;

/// Lifecycle contract shared by every initializer
pub mod initializer;

/// Concrete initializers for each resource type
pub mod initializers;

/// Dependency resolution and three-phase orchestration
pub mod orchestration;

/// Bootstrap file loading and manager construction
pub mod config;

/// Table and JSON health reports
pub mod report;

// Re-export commonly used types
pub use config::BootstrapConfig;
pub use error::{ConfigError, ConfigurationError, ConnectionError, InitError};
pub use initializer::Initializer;
pub use orchestration::{ManagerOptions, StateManager};
pub use status::{State, Status, StatusReport};
