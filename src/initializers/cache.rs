//! Key-value cache initializer speaking RESP

use crate::drivers::RespConnection;
use crate::error::{ConfigurationError, DriverError, InitError, ResourceError};
use crate::initializer::{settings, Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::info;
use std::time::Duration;
use toml::Table;

#[derive(Debug, Clone)]
struct CacheSettings {
    host: String,
    port: u16,
    password: Option<String>,
    database: u8,
    flush_on_init: bool,
    timeout: Duration,
    retry: RetryPolicy,
}

impl CacheSettings {
    fn parse(config: &Table) -> Result<Self, ConfigurationError> {
        let host = settings::required_str(config, "host")?;
        let port = settings::port(config, "port", None)?;
        let password = settings::optional_str(config, "password")?.filter(|p| !p.is_empty());
        let database = settings::integer_in_range(config, "database", Some(0), 0, 15)?;
        let flush_on_init = settings::optional_bool(config, "flush_on_init", false)?;
        let timeout = settings::seconds(config, "timeout", 5.0, false)?;
        let attempts = settings::integer_in_range(config, "retry_attempts", Some(3), 1, 100)?;
        let delay = settings::seconds(config, "retry_delay", 1.0, true)?;

        Ok(Self {
            host,
            port,
            password,
            database: database as u8,
            flush_on_init,
            timeout,
            retry: RetryPolicy::new(attempts as u32, delay),
        })
    }

    fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Connect, authenticate, select the database and confirm with PING
    fn open(&self) -> Result<RespConnection, DriverError> {
        let mut client = RespConnection::connect(&self.host, self.port, self.timeout)?;
        if let Some(password) = &self.password {
            client.auth(password)?;
        }
        if self.database != 0 {
            client.select(self.database)?;
        }
        client.ping()?;
        Ok(client)
    }
}

/// Opens and holds a cache client
pub struct CacheInitializer {
    lifecycle: Lifecycle,
    config: Table,
    settings: Option<CacheSettings>,
    client: Option<RespConnection>,
}

impl CacheInitializer {
    pub fn new(name: &str, config: Table) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "cache"),
            config,
            settings: None,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn client(&mut self) -> Result<&mut RespConnection, ResourceError> {
        let component = self.lifecycle.name().to_string();
        self.client
            .as_mut()
            .ok_or(ResourceError::NotInitialized { component })
    }

    fn driver_error(&self, e: DriverError) -> ResourceError {
        ResourceError::Driver {
            component: self.lifecycle.name().to_string(),
            message: e.to_string(),
        }
    }

    /// Remove every key from the selected database
    pub fn flush(&mut self) -> Result<(), InitError> {
        let result = self.client()?.flush_db();
        result.map_err(|e| self.driver_error(e).into())
    }

    /// Round-trip a PING on the held client
    pub fn ping(&mut self) -> Result<(), InitError> {
        let result = self.client()?.ping();
        result.map_err(|e| self.driver_error(e).into())
    }
}

impl Initializer for CacheInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "cache"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = CacheSettings::parse(&self.config);
        self.settings = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    fn test_connection(&mut self) -> Result<bool, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        let result = self
            .lifecycle
            .connect_with_retry(&settings.target(), settings.retry, || settings.open());
        Ok(result.is_ok())
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        self.client = None;

        let client = self.lifecycle.perform(|lifecycle| {
            let mut client = lifecycle.retry(&settings.target(), settings.retry, || settings.open())?;
            if settings.flush_on_init {
                client.flush_db().map_err(|e| ResourceError::Driver {
                    component: lifecycle.name().to_string(),
                    message: format!("flush failed: {}", e),
                })?;
                info!("{}: flushed database {}", lifecycle.name(), settings.database);
                lifecycle.status_mut().add_data("flushed", true);
            }
            Ok(client)
        })?;
        self.client = Some(client);
        Ok(())
    }

    fn reset(&mut self) {
        self.client = None;
        self.lifecycle.reset();
    }
}
