//! Relational database initializer with scoped transactions

use crate::drivers::{DatabaseConnection, DatabaseDriver, DatabaseParams, PostgresDriver};
use crate::error::{ConfigurationError, DriverError, InitError, ResourceError, TransactionError};
use crate::initializer::{settings, Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::{debug, info, warn};
use std::time::Duration;
use toml::Table;

const SSL_MODES: [&str; 6] = ["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

#[derive(Debug, Clone)]
struct DatabaseSettings {
    params: DatabaseParams,
    timeout: Duration,
    retry: RetryPolicy,
}

impl DatabaseSettings {
    fn parse(config: &Table) -> Result<Self, ConfigurationError> {
        let ssl_mode = settings::optional_str(config, "ssl_mode")?
            .unwrap_or_else(|| "prefer".to_string());
        if !SSL_MODES.contains(&ssl_mode.as_str()) {
            return Err(ConfigurationError::InvalidValue {
                field: "ssl_mode".to_string(),
                reason: format!("'{}' is not one of {}", ssl_mode, SSL_MODES.join(", ")),
            });
        }
        let params = DatabaseParams {
            host: settings::required_str(config, "host")?,
            port: settings::port(config, "port", None)?,
            database: settings::required_str(config, "database")?,
            username: settings::required_str(config, "username")?,
            password: settings::required_secret(config, "password")?,
            ssl_mode,
        };
        let timeout = settings::seconds(config, "timeout", 30.0, false)?;
        let attempts = settings::integer_in_range(config, "retry_attempts", Some(3), 1, 100)?;
        let delay = settings::seconds(config, "retry_delay", 1.0, true)?;

        Ok(Self {
            params,
            timeout,
            retry: RetryPolicy::new(attempts as u32, delay),
        })
    }

    fn target(&self) -> String {
        format!(
            "{}:{}/{}",
            self.params.host, self.params.port, self.params.database
        )
    }
}

/// An open database session that allows one transaction at a time
///
/// A transaction still open when the session is dropped is rolled back.
pub struct Session {
    component: String,
    connection: Box<dyn DatabaseConnection>,
    in_transaction: bool,
}

impl Session {
    fn new(component: &str, connection: Box<dyn DatabaseConnection>) -> Self {
        Self {
            component: component.to_string(),
            connection,
            in_transaction: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// # Errors
    ///
    /// `TransactionError::AlreadyActive` if a transaction is open.
    pub fn begin(&mut self) -> Result<(), TransactionError> {
        if self.in_transaction {
            return Err(TransactionError::AlreadyActive);
        }
        self.connection
            .begin()
            .map_err(|e| TransactionError::BeginFailed(e.to_string()))?;
        self.in_transaction = true;
        debug!("{}: transaction started", self.component);
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionError::NoActiveTransaction` without an open transaction. A failed
    /// commit leaves the transaction open so that it is rolled back later.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        if !self.in_transaction {
            return Err(TransactionError::NoActiveTransaction);
        }
        self.connection
            .commit()
            .map_err(|e| TransactionError::CommitFailed(e.to_string()))?;
        self.in_transaction = false;
        debug!("{}: transaction committed", self.component);
        Ok(())
    }

    /// # Errors
    ///
    /// `TransactionError::NoActiveTransaction` without an open transaction.
    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.in_transaction {
            return Err(TransactionError::NoActiveTransaction);
        }
        self.in_transaction = false;
        self.connection
            .rollback()
            .map_err(|e| TransactionError::RollbackFailed(e.to_string()))?;
        debug!("{}: transaction rolled back", self.component);
        Ok(())
    }

    /// Run one statement, returning the affected row count
    pub fn execute(&mut self, statement: &str) -> Result<u64, InitError> {
        self.connection.execute(statement).map_err(|e| {
            ResourceError::Driver {
                component: self.component.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }

    fn ping(&mut self) -> Result<(), DriverError> {
        self.connection.ping()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction {
            match self.rollback() {
                Ok(()) => info!(
                    "{}: rolled back unterminated transaction on teardown",
                    self.component
                ),
                Err(e) => warn!("{}: {}", self.component, e),
            }
        }
    }
}

/// Scoped transaction
///
/// Dropping the guard without calling [`Transaction::commit`] rolls the
/// transaction back, including during unwinding.
pub struct Transaction<'a> {
    session: &'a mut Session,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn execute(&mut self, statement: &str) -> Result<u64, InitError> {
        self.session.execute(statement)
    }

    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.finished = true;
        self.session.commit()
    }

    pub fn rollback(mut self) -> Result<(), TransactionError> {
        self.finished = true;
        self.session.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.session.in_transaction() {
            if let Err(e) = self.session.rollback() {
                warn!("{}: {}", self.session.component, e);
            }
        }
    }
}

/// Opens and holds a database session
///
/// # Example
/// ```
/// use preflight::drivers::MemoryDatabase;
/// use preflight::initializer::Initializer;
/// use preflight::initializers::DatabaseInitializer;
///
/// let config: toml::Table = toml::from_str(r#"
///     host = "localhost"
///     port = 5432
///     database = "app"
///     username = "app"
///     password = "secret"
/// "#).unwrap();
/// let mut db = DatabaseInitializer::with_driver("database", config, Box::new(MemoryDatabase::new()));
/// db.validate_configuration().unwrap();
/// db.perform_initialization().unwrap();
///
/// let mut tx = db.transaction().unwrap();
/// tx.execute("INSERT INTO jobs VALUES (1)").unwrap();
/// tx.commit().unwrap();
/// ```
pub struct DatabaseInitializer {
    lifecycle: Lifecycle,
    config: Table,
    settings: Option<DatabaseSettings>,
    driver: Box<dyn DatabaseDriver>,
    session: Option<Session>,
}

impl DatabaseInitializer {
    /// Create an initializer using the PostgreSQL driver
    pub fn new(name: &str, config: Table) -> Self {
        Self::with_driver(name, config, Box::new(PostgresDriver))
    }

    pub fn with_driver(name: &str, config: Table, driver: Box<dyn DatabaseDriver>) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "database"),
            config,
            settings: None,
            driver,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.session.as_ref().is_some_and(Session::in_transaction)
    }

    fn session_mut(&mut self) -> Result<&mut Session, TransactionError> {
        self.session.as_mut().ok_or(TransactionError::NotConnected)
    }

    pub fn begin_transaction(&mut self) -> Result<(), TransactionError> {
        self.session_mut()?.begin()
    }

    pub fn commit(&mut self) -> Result<(), TransactionError> {
        self.session_mut()?.commit()
    }

    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        self.session_mut()?.rollback()
    }

    /// Begin a transaction scoped to the returned guard
    pub fn transaction(&mut self) -> Result<Transaction<'_>, TransactionError> {
        let session = self.session_mut()?;
        session.begin()?;
        Ok(Transaction {
            session,
            finished: false,
        })
    }

    /// Run a statement on the held session
    pub fn execute(&mut self, statement: &str) -> Result<u64, InitError> {
        let component = self.lifecycle.name().to_string();
        self.session
            .as_mut()
            .ok_or(ResourceError::NotInitialized { component })?
            .execute(statement)
    }

    fn open(
        driver: &dyn DatabaseDriver,
        settings: &DatabaseSettings,
    ) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        let mut connection = driver.connect(&settings.params, settings.timeout)?;
        connection.ping()?;
        Ok(connection)
    }
}

impl Initializer for DatabaseInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "database"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = DatabaseSettings::parse(&self.config);
        self.settings = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    fn test_connection(&mut self) -> Result<bool, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        let driver = self.driver.as_ref();
        let result = self
            .lifecycle
            .connect_with_retry(&settings.target(), settings.retry, || {
                Self::open(driver, &settings)
            });
        Ok(result.is_ok())
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        if let Some(session) = self.session.as_mut() {
            if session.ping().is_ok() {
                debug!("{}: reusing open session", self.lifecycle.name());
                return Ok(());
            }
        }
        self.session = None;

        let driver = self.driver.as_ref();
        let connection = self.lifecycle.perform(|lifecycle| {
            let connection = lifecycle.retry(&settings.target(), settings.retry, || {
                Self::open(driver, &settings)
            })?;
            lifecycle.status_mut().add_data("database", settings.params.database.as_str());
            Ok(connection)
        })?;
        self.session = Some(Session::new(self.lifecycle.name(), connection));
        Ok(())
    }

    fn reset(&mut self) {
        self.session = None;
        self.lifecycle.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemoryDatabase, MockDatabaseConnection, MockDatabaseDriver};
    use crate::initializer::CONNECTION_OPERATION;
    use std::net::TcpListener;

    fn config(extra: &str) -> Table {
        format!(
            "host = \"127.0.0.1\"\nport = 5432\ndatabase = \"app\"\nusername = \"svc\"\npassword = \"pw\"\n{}",
            extra
        )
        .parse()
        .unwrap()
    }

    fn ready(db: &MemoryDatabase) -> DatabaseInitializer {
        let mut init = DatabaseInitializer::with_driver("database", config(""), Box::new(db.clone()));
        init.validate_configuration().unwrap();
        init.perform_initialization().unwrap();
        init
    }

    #[test]
    fn test_validation_names_missing_field() {
        let table: Table = "host = \"db\"\nport = 5432".parse().unwrap();
        let mut init = DatabaseInitializer::new("database", table);
        let err = init.validate_configuration().unwrap_err();
        assert_eq!(err.field(), "database");
        assert!(init.status().has_errors());
    }

    #[test]
    fn test_validation_rejects_bad_retry_bounds() {
        let mut init = DatabaseInitializer::new("database", config("retry_attempts = 0"));
        assert_eq!(
            init.validate_configuration().unwrap_err().field(),
            "retry_attempts"
        );
        let mut init = DatabaseInitializer::new("database", config("timeout = 0"));
        assert_eq!(init.validate_configuration().unwrap_err().field(), "timeout");
        let mut init = DatabaseInitializer::new("database", config("ssl_mode = \"always\""));
        assert_eq!(init.validate_configuration().unwrap_err().field(), "ssl_mode");
    }

    #[test]
    fn test_phases_require_validation() {
        let mut init = DatabaseInitializer::new("database", config(""));
        assert!(matches!(
            init.test_connection(),
            Err(InitError::NotValidated(_))
        ));
        assert!(matches!(
            init.perform_initialization(),
            Err(InitError::NotValidated(_))
        ));
    }

    #[test]
    fn test_unreachable_host_exhausts_retries() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut table = config("retry_attempts = 3\nretry_delay = 0.01\ntimeout = 1");
        table.insert("port".into(), toml::Value::Integer(i64::from(port)));
        let mut init = DatabaseInitializer::new("database", table);
        init.validate_configuration().unwrap();

        assert!(!init.test_connection().unwrap());
        let err = init.lifecycle().last_connection_error().unwrap();
        assert_eq!(err.attempts, 3);
        assert!(init.status().errors()[0].starts_with("ConnectionError"));
        assert_eq!(
            init.lifecycle().monitor().count("database", CONNECTION_OPERATION),
            3
        );
    }

    #[test]
    fn test_mock_driver_is_retried() {
        let mut driver = MockDatabaseDriver::new();
        driver.expect_connect().times(2).returning(|params, _| {
            Err(DriverError::Resolve(format!("{}: no such host", params.host)))
        });
        let mut init = DatabaseInitializer::with_driver(
            "database",
            config("retry_attempts = 2\nretry_delay = 0"),
            Box::new(driver),
        );
        init.validate_configuration().unwrap();
        assert!(!init.test_connection().unwrap());
        assert_eq!(init.lifecycle().last_connection_error().unwrap().attempts, 2);
    }

    #[test]
    fn test_rejected_credentials_are_classified() {
        let mut driver = MockDatabaseDriver::new();
        driver
            .expect_connect()
            .withf(|params, _| params.username == "svc" && params.password == "pw")
            .times(1)
            .returning(|params, _| {
                Err(DriverError::Server(format!(
                    "password authentication failed for user \"{}\" (SQLSTATE 28P01)",
                    params.username
                )))
            });
        let mut init = DatabaseInitializer::with_driver(
            "primary",
            config("retry_attempts = 1"),
            Box::new(driver),
        );
        init.validate_configuration().unwrap();
        assert!(!init.test_connection().unwrap());

        let err = init.lifecycle().last_connection_error().unwrap();
        assert!(err.last_error.contains("password authentication failed"));
        assert_eq!(init.lifecycle().detector().errors("primary").len(), 1);
        assert!(init.status().has_warnings());
    }

    #[test]
    fn test_missing_database_fails_perform() {
        let mut driver = MockDatabaseDriver::new();
        driver
            .expect_connect()
            .withf(|params, _| params.database == "ghost")
            .times(2)
            .returning(|params, _| {
                Err(DriverError::Server(format!(
                    "database \"{}\" does not exist (SQLSTATE 3D000)",
                    params.database
                )))
            });
        let mut table = config("retry_attempts = 2\nretry_delay = 0");
        table.insert("database".into(), toml::Value::String("ghost".into()));
        let mut init = DatabaseInitializer::with_driver("database", table, Box::new(driver));
        init.validate_configuration().unwrap();

        let err = init.perform_initialization().unwrap_err();
        assert!(matches!(err, InitError::Connection(ref e) if e.attempts == 2));
        assert!(err.to_string().contains("does not exist"));
        assert!(init.status().is_failed());
        assert!(!init.is_connected());
    }

    #[test]
    fn test_perform_failure_marks_failed() {
        let db = MemoryDatabase::unreachable();
        let mut init = DatabaseInitializer::with_driver(
            "database",
            config("retry_attempts = 1"),
            Box::new(db),
        );
        init.validate_configuration().unwrap();
        let err = init.perform_initialization().unwrap_err();
        assert!(matches!(err, InitError::Connection(_)));
        assert!(init.status().is_failed());
        assert_eq!(init.status().errors().len(), 1);
        assert!(!init.is_connected());
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let db = MemoryDatabase::new();
        let mut init = ready(&db);
        init.begin_transaction().unwrap();
        assert_eq!(
            init.begin_transaction(),
            Err(TransactionError::AlreadyActive)
        );
        init.commit().unwrap();
        assert_eq!(init.commit(), Err(TransactionError::NoActiveTransaction));
        assert_eq!(init.rollback(), Err(TransactionError::NoActiveTransaction));
    }

    #[test]
    fn test_transactions_need_a_session() {
        let mut init = DatabaseInitializer::new("database", config(""));
        assert_eq!(init.begin_transaction(), Err(TransactionError::NotConnected));
        assert!(matches!(
            init.execute("SELECT 1"),
            Err(InitError::Resource(ResourceError::NotInitialized { .. }))
        ));
    }

    #[test]
    fn test_teardown_rolls_back_open_transaction() {
        let db = MemoryDatabase::new();
        {
            let mut init = ready(&db);
            init.begin_transaction().unwrap();
            init.execute("INSERT INTO jobs VALUES (1)").unwrap();
        }
        assert_eq!(db.rollbacks(), 1);
        assert!(db.committed().is_empty());

        let mut init = ready(&db);
        init.begin_transaction().unwrap();
        init.reset();
        assert_eq!(db.rollbacks(), 2);
        assert_eq!(init.status().state(), crate::status::State::Pending);
    }

    #[test]
    fn test_transaction_guard() {
        let db = MemoryDatabase::new();
        let mut init = ready(&db);

        let mut tx = init.transaction().unwrap();
        tx.execute("INSERT INTO jobs VALUES (1)").unwrap();
        tx.commit().unwrap();
        assert_eq!(db.committed(), vec!["INSERT INTO jobs VALUES (1)".to_string()]);

        {
            let mut tx = init.transaction().unwrap();
            tx.execute("INSERT INTO jobs VALUES (2)").unwrap();
        }
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.committed().len(), 1);
        assert!(!init.in_transaction());
    }

    #[test]
    fn test_transaction_guard_rolls_back_on_panic() {
        let db = MemoryDatabase::new();
        let mut init = ready(&db);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut tx = init.transaction().unwrap();
            tx.execute("DELETE FROM jobs").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(db.rollbacks(), 1);
        assert!(!init.in_transaction());
    }

    #[test]
    fn test_rollback_failure_is_surfaced() {
        let mut connection = MockDatabaseConnection::new();
        connection.expect_ping().returning(|| Ok(()));
        connection.expect_begin().returning(|| Ok(()));
        connection
            .expect_rollback()
            .returning(|| Err(DriverError::Server("connection lost".into())));
        let mut driver = MockDatabaseDriver::new();
        driver
            .expect_connect()
            .return_once(move |_, _| Ok(Box::new(connection) as Box<dyn DatabaseConnection>));

        let mut init = DatabaseInitializer::with_driver("database", config(""), Box::new(driver));
        init.validate_configuration().unwrap();
        init.perform_initialization().unwrap();
        init.begin_transaction().unwrap();
        assert!(matches!(
            init.rollback(),
            Err(TransactionError::RollbackFailed(_))
        ));
        assert!(!init.in_transaction());
    }

    #[test]
    fn test_perform_is_idempotent() {
        let db = MemoryDatabase::new();
        let mut init = ready(&db);
        init.perform_initialization().unwrap();
        assert_eq!(db.connect_attempts(), 1);
    }
}
