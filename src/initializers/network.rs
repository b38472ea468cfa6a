//! Socket reachability initializer for named endpoints

use crate::drivers::tcp;
use crate::error::{ConfigurationError, ConnectionError, InitError, ResourceError};
use crate::initializer::settings::{self, nested};
use crate::initializer::{Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::{debug, info};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use toml::Table;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    name: String,
    host: String,
    port: u16,
    timeout: Duration,
}

impl Endpoint {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_endpoints(config: &Table) -> Result<Vec<Endpoint>, ConfigurationError> {
    let connections = settings::table(config, "connections")?
        .ok_or_else(|| ConfigurationError::Missing("connections".to_string()))?;
    if connections.is_empty() {
        return Err(ConfigurationError::Empty("connections".to_string()));
    }

    connections
        .iter()
        .map(|(name, value)| {
            let field = format!("connections.{}", name);
            let entry = value.as_table().ok_or_else(|| ConfigurationError::InvalidType {
                field: field.clone(),
                expected: "table".to_string(),
            })?;
            let parse = || -> Result<Endpoint, ConfigurationError> {
                Ok(Endpoint {
                    name: name.clone(),
                    host: settings::required_str(entry, "host")?,
                    port: settings::port(entry, "port", None)?,
                    timeout: settings::seconds(entry, "timeout", 5.0, false)?,
                })
            };
            parse().map_err(|e| nested(e, &field))
        })
        .collect()
}

/// Connects to named TCP endpoints and holds one open stream per endpoint
pub struct NetworkInitializer {
    lifecycle: Lifecycle,
    config: Table,
    endpoints: Option<Vec<Endpoint>>,
    streams: Vec<(String, TcpStream)>,
}

impl NetworkInitializer {
    pub fn new(name: &str, config: Table) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "network"),
            config,
            endpoints: None,
            streams: Vec::new(),
        }
    }

    /// Names of the validated endpoints, in connection order
    pub fn endpoint_names(&self) -> Vec<&str> {
        self.endpoints
            .iter()
            .flatten()
            .map(|endpoint| endpoint.name.as_str())
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.streams.len()
    }

    /// The held stream for an endpoint, once initialized
    pub fn stream(&self, name: &str) -> Option<&TcpStream> {
        self.streams
            .iter()
            .find(|(endpoint, _)| endpoint == name)
            .map(|(_, stream)| stream)
    }

    /// Connect to every endpoint once, returning the open streams and the failures
    fn connect_all(
        lifecycle: &mut Lifecycle,
        endpoints: &[Endpoint],
    ) -> (Vec<(String, TcpStream)>, Vec<ConnectionError>) {
        let mut streams = Vec::new();
        let mut failures = Vec::new();
        for endpoint in endpoints {
            let result = lifecycle.retry(&endpoint.target(), RetryPolicy::once(), || {
                tcp::connect(&endpoint.host, endpoint.port, endpoint.timeout)
            });
            match result {
                Ok(stream) => {
                    debug!("{}: endpoint '{}' reachable", lifecycle.name(), endpoint.name);
                    streams.push((endpoint.name.clone(), stream));
                }
                Err(mut err) => {
                    err.target = format!("{} ({})", endpoint.name, err.target);
                    failures.push(err);
                }
            }
        }
        (streams, failures)
    }

    fn close_all(&mut self) {
        for (name, stream) in self.streams.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("{}: closed connection to '{}'", self.lifecycle.name(), name);
        }
    }
}

impl Initializer for NetworkInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "network"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = parse_endpoints(&self.config);
        self.endpoints = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    /// Open and immediately close a socket per endpoint
    fn test_connection(&mut self) -> Result<bool, InitError> {
        let endpoints = validated(&self.lifecycle, &self.endpoints)?.clone();
        let (streams, failures) = Self::connect_all(&mut self.lifecycle, &endpoints);
        for (_, stream) in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let reachable = failures.is_empty();
        self.lifecycle
            .status_mut()
            .add_data("unreachable", failures.iter().map(|f| f.target.clone()).collect::<Vec<_>>());
        for failure in failures {
            self.lifecycle.record_connection_error(failure);
        }
        Ok(reachable)
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let endpoints = validated(&self.lifecycle, &self.endpoints)?.clone();
        self.close_all();

        let streams = self.lifecycle.perform(|lifecycle| {
            let (streams, failures) = Self::connect_all(lifecycle, &endpoints);
            if !failures.is_empty() {
                let details = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.target, f.last_error))
                    .collect();
                return Err(ResourceError::Unreachable(details).into());
            }
            lifecycle.status_mut().add_data("endpoints", streams.len());
            Ok(streams)
        })?;
        info!(
            "{}: holding {} endpoint connection(s)",
            self.lifecycle.name(),
            streams.len()
        );
        self.streams = streams;
        Ok(())
    }

    fn reset(&mut self) {
        self.close_all();
        self.lifecycle.reset();
    }
}

impl Drop for NetworkInitializer {
    fn drop(&mut self) {
        self.close_all();
    }
}
