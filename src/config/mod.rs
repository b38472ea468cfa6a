//! Bootstrap file describing which resources to initialize
//!
//! ```toml
//! [manager]
//! rollback_on_failure = true
//!
//! [initializers.storage]
//! type = "filesystem"
//! base_path = "/var/lib/app"
//! required_dirs = ["cache", "logs"]
//!
//! [initializers.database]
//! type = "database"
//! depends_on = ["storage"]
//! host = "db.internal"
//! ```
//!
//! `type`, `driver` and `depends_on` are read here; every other key is handed
//! to the initializer untouched and checked by its own validation.

use crate::drivers::{MemoryBroker, MemoryDatabase};
use crate::error::ConfigError;
use crate::initializer::Initializer;
use crate::initializers::{
    CacheInitializer, DatabaseInitializer, ExternalApiInitializer, FileSystemInitializer,
    NetworkInitializer, QueueInitializer,
};
use crate::orchestration::{ManagerOptions, StateManager};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use toml::Table;

/// Resource types the factory knows how to build
pub const RESOURCE_TYPES: [&str; 6] = [
    "database",
    "cache",
    "queue",
    "filesystem",
    "network",
    "external_api",
];

/// Which driver backs a database or queue initializer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Protocol clients: PostgreSQL for databases, AMQP for queues
    #[default]
    #[serde(alias = "tcp")]
    Native,
    /// In-process driver with full semantics, for development setups
    Memory,
}

/// One `[initializers.<name>]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitializerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Everything else, passed through as the initializer's configuration
    #[serde(flatten)]
    pub settings: Table,
}

/// Parsed bootstrap file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub manager: ManagerOptions,
    #[serde(default)]
    pub initializers: BTreeMap<String, InitializerConfig>,
}

impl BootstrapConfig {
    /// Load and check a bootstrap file
    ///
    /// # Errors
    ///
    /// * `ConfigError::ReadError` - the file cannot be read
    /// * `ConfigError::TomlError` - the file is not valid TOML or has wrong types
    /// * `ConfigError::ValidationError` - unknown types, drivers or dependencies
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading bootstrap configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        text.parse()
    }

    /// Check what the factory relies on; resource settings are left to the initializers
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initializers.is_empty() {
            return Err(ConfigError::ValidationError(
                "no initializers configured".to_string(),
            ));
        }
        for (name, section) in &self.initializers {
            if !RESOURCE_TYPES.contains(&section.kind.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "initializers.{}.type: unknown resource type '{}' (expected one of {})",
                    name,
                    section.kind,
                    RESOURCE_TYPES.join(", ")
                )));
            }
            if section.driver == DriverKind::Memory
                && !matches!(section.kind.as_str(), "database" | "queue")
            {
                return Err(ConfigError::ValidationError(format!(
                    "initializers.{}.driver: the memory driver is not available for {}",
                    name, section.kind
                )));
            }
            if let Some(missing) = section
                .depends_on
                .iter()
                .find(|dep| !self.initializers.contains_key(dep.as_str()))
            {
                return Err(ConfigError::ValidationError(format!(
                    "initializers.{}.depends_on: '{}' is not configured",
                    name, missing
                )));
            }
        }
        Ok(())
    }

    /// Build a manager with one registered initializer per section
    ///
    /// Sections are registered in name order; the manager still orders them by
    /// their dependencies when it runs.
    pub fn build_manager(&self) -> Result<StateManager, ConfigError> {
        self.validate()?;
        let mut manager = StateManager::with_options(self.manager);
        for (name, section) in &self.initializers {
            let mut initializer = build_initializer(name, section)?;
            for dependency in &section.depends_on {
                initializer.depends_on(dependency);
            }
            debug!("Built {} initializer '{}'", section.kind, name);
            manager.register(initializer)?;
        }
        Ok(manager)
    }
}

impl FromStr for BootstrapConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: BootstrapConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

fn build_initializer(
    name: &str,
    section: &InitializerConfig,
) -> Result<Box<dyn Initializer>, ConfigError> {
    let settings = section.settings.clone();
    let initializer: Box<dyn Initializer> = match (section.kind.as_str(), section.driver) {
        ("database", DriverKind::Native) => Box::new(DatabaseInitializer::new(name, settings)),
        ("database", DriverKind::Memory) => Box::new(DatabaseInitializer::with_driver(
            name,
            settings,
            Box::new(MemoryDatabase::new()),
        )),
        ("queue", DriverKind::Native) => Box::new(QueueInitializer::new(name, settings)),
        ("queue", DriverKind::Memory) => Box::new(QueueInitializer::with_broker(
            name,
            settings,
            Box::new(MemoryBroker::new()),
        )),
        ("cache", _) => Box::new(CacheInitializer::new(name, settings)),
        ("filesystem", _) => Box::new(FileSystemInitializer::new(name, settings)),
        ("network", _) => Box::new(NetworkInitializer::new(name, settings)),
        ("external_api", _) => Box::new(ExternalApiInitializer::new(name, settings)),
        (other, _) => {
            return Err(ConfigError::ValidationError(format!(
                "initializers.{}.type: unknown resource type '{}'",
                name, other
            )))
        }
    };
    Ok(initializer)
}
