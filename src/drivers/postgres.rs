//! PostgreSQL driver backed by sqlx
//!
//! Each session owns a current-thread runtime that the blocking trait
//! methods drive; the connection is registered with that runtime's reactor
//! and never leaves it.

use crate::drivers::{DatabaseConnection, DatabaseDriver, DatabaseParams};
use crate::error::DriverError;
use log::debug;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Statement used to confirm a session is still usable
const PING_STATEMENT: &str = "SELECT 1";

/// Opens PostgreSQL sessions with the configured credentials and database
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl PostgresDriver {
    fn options(params: &DatabaseParams) -> Result<PgConnectOptions, DriverError> {
        let ssl_mode: PgSslMode = params.ssl_mode.parse().map_err(|e| {
            DriverError::Protocol(format!("invalid ssl mode '{}': {}", params.ssl_mode, e))
        })?;
        Ok(PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .database(&params.database)
            .username(&params.username)
            .password(&params.password)
            .ssl_mode(ssl_mode)
            .application_name(env!("CARGO_PKG_NAME")))
    }
}

impl DatabaseDriver for PostgresDriver {
    fn connect(
        &self,
        params: &DatabaseParams,
        timeout: Duration,
    ) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        let options = Self::options(params)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let connection = block_on(&runtime, timeout, PgConnection::connect_with(&options))?;
        debug!(
            "Opened PostgreSQL session to {}:{}/{}",
            params.host, params.port, params.database
        );
        Ok(Box::new(PostgresSession {
            runtime,
            connection: Some(connection),
            timeout,
        }))
    }
}

struct PostgresSession {
    runtime: Runtime,
    connection: Option<PgConnection>,
    timeout: Duration,
}

impl DatabaseConnection for PostgresSession {
    fn ping(&mut self) -> Result<(), DriverError> {
        self.execute(PING_STATEMENT).map(|_| ())
    }

    fn execute(&mut self, statement: &str) -> Result<u64, DriverError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DriverError::Protocol("connection is closed".to_string()))?;
        let result = block_on(&self.runtime, self.timeout, connection.execute(statement))?;
        Ok(result.rows_affected())
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = block_on(&self.runtime, self.timeout, connection.close()) {
                debug!("PostgreSQL session did not close cleanly: {}", e);
            }
        }
    }
}

/// Run `future` to completion on `runtime`, bounded by `timeout`
fn block_on<T, F>(runtime: &Runtime, timeout: Duration, future: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match runtime.block_on(async { tokio::time::timeout(timeout, future).await }) {
        Ok(result) => result.map_err(driver_error),
        Err(_) => Err(DriverError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer from the server within {:?}", timeout),
        ))),
    }
}

fn driver_error(e: sqlx::Error) -> DriverError {
    match e {
        sqlx::Error::Io(e) => DriverError::Io(e),
        sqlx::Error::Database(e) => match e.code() {
            Some(code) => DriverError::Server(format!("{} (SQLSTATE {})", e.message(), code)),
            None => DriverError::Server(e.message().to_string()),
        },
        other => DriverError::Protocol(other.to_string()),
    }
}
