//! Resource drivers wrapped by the initializers
//!
//! The wire protocols of databases and brokers are external concerns; the
//! initializers talk to them through the traits below. Two families are
//! provided: protocol clients for PostgreSQL and AMQP brokers, and in-process
//! memory drivers with the same semantics.

use crate::error::DriverError;
use std::fmt;
use std::time::Duration;

/// AMQP 0-9-1 broker client
pub mod amqp;
/// In-process database and broker implementations
pub mod memory;
/// PostgreSQL client
pub mod postgres;
/// Minimal RESP client used by the cache initializer
pub mod resp;
/// Shared TCP connect helper
pub mod tcp;

pub use amqp::AmqpBroker;
pub use memory::{MemoryBroker, MemoryDatabase};
pub use postgres::PostgresDriver;
pub use resp::{RespConnection, RespValue};
pub use tcp::connect;

/// Connection parameters for a relational database
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// TLS negotiation: disable, allow, prefer, require, verify-ca or verify-full
    pub ssl_mode: String,
}

impl fmt::Debug for DatabaseParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Connection parameters for a message broker
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl fmt::Debug for BrokerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Opens database sessions
#[cfg_attr(test, mockall::automock)]
pub trait DatabaseDriver: Send {
    fn connect(
        &self,
        params: &DatabaseParams,
        timeout: Duration,
    ) -> Result<Box<dyn DatabaseConnection>, DriverError>;
}

/// An open database session
///
/// Transaction control defaults to issuing the corresponding statements.
#[cfg_attr(test, mockall::automock)]
pub trait DatabaseConnection: Send {
    fn ping(&mut self) -> Result<(), DriverError>;

    fn execute(&mut self, statement: &str) -> Result<u64, DriverError>;

    fn begin(&mut self) -> Result<(), DriverError> {
        self.execute("BEGIN").map(|_| ())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.execute("COMMIT").map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.execute("ROLLBACK").map(|_| ())
    }
}

/// Opens broker connections
#[cfg_attr(test, mockall::automock)]
pub trait Broker: Send {
    fn connect(
        &self,
        params: &BrokerParams,
        timeout: Duration,
    ) -> Result<Box<dyn BrokerConnection>, DriverError>;
}

/// An open broker connection
#[cfg_attr(test, mockall::automock)]
pub trait BrokerConnection: Send {
    fn open_channel(&mut self) -> Result<Box<dyn Channel>, DriverError>;

    fn close(&mut self);
}

/// A channel on a broker connection
#[cfg_attr(test, mockall::automock)]
pub trait Channel: Send {
    fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DriverError>;

    fn declare_exchange(&mut self, name: &str, kind: &str) -> Result<(), DriverError>;

    fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError>;

    /// Publish a message; returns the number of queues it was routed to, or
    /// 1 for any routed message where the broker does not report fan-out
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<usize, DriverError>;

    /// Take the next message from a queue, if any
    fn consume(&mut self, queue: &str) -> Result<Option<Vec<u8>>, DriverError>;
}
