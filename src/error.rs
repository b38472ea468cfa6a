use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating an initializer's configuration map
///
/// Always synchronous and never retried. Every variant names the offending field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Missing required configuration key: {0}")]
    Missing(String),

    #[error("Invalid type for '{field}': expected {expected}")]
    InvalidType { field: String, expected: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration key '{0}' must not be empty")]
    Empty(String),
}

impl ConfigurationError {
    /// Name of the configuration key that failed validation
    pub fn field(&self) -> &str {
        match self {
            ConfigurationError::Missing(field) | ConfigurationError::Empty(field) => field,
            ConfigurationError::InvalidType { field, .. }
            | ConfigurationError::InvalidValue { field, .. } => field,
        }
    }
}

/// Connection attempts exhausted without reaching the resource
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("ConnectionError: failed to connect to {target} after {attempts} attempt(s): {last_error}")]
pub struct ConnectionError {
    /// Initializer that gave up
    pub component: String,
    /// Human-readable target (host:port, URL, path)
    pub target: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
    /// Message of the final failed attempt
    pub last_error: String,
}

/// Perform-phase failures specific to a resource
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("ResourceError: '{}' exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("ResourceError: permission mismatch on '{}': expected {expected:o}, found {actual:o}", path.display())]
    PermissionMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("ResourceError: I/O failure on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ResourceError: unreachable endpoints: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("ResourceError: {component} is not initialized")]
    NotInitialized { component: String },

    #[error("ResourceError: {component}: {message}")]
    Driver { component: String, message: String },

    #[error("ResourceError: HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },
}

/// Misuse or failure of database transactions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("TransactionError: a transaction is already active")]
    AlreadyActive,

    #[error("TransactionError: no active transaction")]
    NoActiveTransaction,

    #[error("TransactionError: database connection is not open")]
    NotConnected,

    #[error("TransactionError: begin failed: {0}")]
    BeginFailed(String),

    #[error("TransactionError: commit failed: {0}")]
    CommitFailed(String),

    #[error("TransactionError: rollback failed: {0}")]
    RollbackFailed(String),
}

/// A dependency cycle among registered initializers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("CircularDependencyError: {}", .cycle.join(" -> "))]
pub struct CircularDependencyError {
    /// Initializer names along the cycle; the first name is repeated at the end
    pub cycle: Vec<String>,
}

/// Umbrella error returned by initializers and the state manager
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    CircularDependency(#[from] CircularDependencyError),

    #[error("Initializer '{initializer}' depends on unregistered '{dependency}'")]
    UnknownDependency {
        initializer: String,
        dependency: String,
    },

    #[error("Initializer '{0}' is already registered")]
    DuplicateInitializer(String),

    #[error("Initializer '{0}' has not validated its configuration")]
    NotValidated(String),

    #[error("Initializer '{component}' failed during {phase}: {source}")]
    Phase {
        component: String,
        phase: &'static str,
        #[source]
        source: Box<InitError>,
    },
}

impl InitError {
    /// Strip any phase wrapping and return the underlying error
    pub fn root(&self) -> &InitError {
        match self {
            InitError::Phase { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Errors surfaced by resource drivers (sockets, protocol clients)
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve address: {0}")]
    Resolve(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Contract violations in the performance monitor and data collector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("No measurement in flight for ({component}, {operation})")]
    NotStarted { component: String, operation: String },

    #[error("No timer running named '{0}'")]
    TimerNotStarted(String),
}

/// Errors that can occur during bootstrap file loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Registration(#[from] InitError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_field() {
        let err = ConfigurationError::InvalidValue {
            field: "port".to_string(),
            reason: "must be between 1 and 65535".to_string(),
        };
        assert_eq!(err.field(), "port");
        assert!(err.to_string().contains("port"));

        assert_eq!(ConfigurationError::Missing("host".into()).field(), "host");
        assert_eq!(ConfigurationError::Empty("required_dirs".into()).field(), "required_dirs");
    }

    #[test]
    fn test_circular_dependency_message() {
        let err = CircularDependencyError {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "CircularDependencyError: a -> b -> a");
    }

    #[test]
    fn test_not_a_directory_message() {
        let err = ResourceError::NotADirectory(PathBuf::from("/tmp/x/cache"));
        assert!(err.to_string().contains("exists but is not a directory"));
    }

    #[test]
    fn test_root_unwraps_phase() {
        let inner = InitError::Transaction(TransactionError::AlreadyActive);
        let wrapped = InitError::Phase {
            component: "database".into(),
            phase: "perform",
            source: Box::new(inner),
        };
        assert!(matches!(
            wrapped.root(),
            InitError::Transaction(TransactionError::AlreadyActive)
        ));
    }
}
