//! In-process database and broker drivers
//!
//! Useful for development setups and tests that need real transaction and routing
//! semantics without external servers. Each handle is cheap to clone; clones share
//! state, so a test can keep one handle while the initializer owns another.

use crate::drivers::{
    Broker, BrokerConnection, BrokerParams, Channel, DatabaseConnection, DatabaseDriver,
    DatabaseParams,
};
use crate::error::DriverError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct DatabaseState {
    reachable: bool,
    connect_attempts: u32,
    /// Statements made durable by commit (or executed outside a transaction)
    committed: Vec<String>,
    /// Every statement and transaction-control command, in order
    journal: Vec<String>,
    rollbacks: u32,
}

/// In-process database
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DatabaseState {
                reachable: true,
                connect_attempts: 0,
                committed: Vec::new(),
                journal: Vec::new(),
                rollbacks: 0,
            })),
        }
    }

    /// A database that refuses every connection
    pub fn unreachable() -> Self {
        let db = Self::new();
        db.set_reachable(false);
        db
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    pub fn committed(&self) -> Vec<String> {
        lock(&self.state).committed.clone()
    }

    pub fn journal(&self) -> Vec<String> {
        lock(&self.state).journal.clone()
    }

    pub fn rollbacks(&self) -> u32 {
        lock(&self.state).rollbacks
    }
}

impl DatabaseDriver for MemoryDatabase {
    fn connect(
        &self,
        params: &DatabaseParams,
        _timeout: Duration,
    ) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused by {}:{}", params.host, params.port),
            )));
        }
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            pending: None,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<DatabaseState>>,
    /// Statements of the open transaction
    pending: Option<Vec<String>>,
}

impl DatabaseConnection for MemorySession {
    fn ping(&mut self) -> Result<(), DriverError> {
        if lock(&self.state).reachable {
            Ok(())
        } else {
            Err(DriverError::Protocol("server went away".to_string()))
        }
    }

    fn execute(&mut self, statement: &str) -> Result<u64, DriverError> {
        let mut state = lock(&self.state);
        state.journal.push(statement.to_string());
        match self.pending.as_mut() {
            Some(pending) => pending.push(statement.to_string()),
            None => state.committed.push(statement.to_string()),
        }
        Ok(1)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        if self.pending.is_some() {
            return Err(DriverError::Server(
                "there is already a transaction in progress".to_string(),
            ));
        }
        lock(&self.state).journal.push("BEGIN".to_string());
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| DriverError::Server("there is no transaction in progress".into()))?;
        let mut state = lock(&self.state);
        state.journal.push("COMMIT".to_string());
        state.committed.extend(pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.pending
            .take()
            .ok_or_else(|| DriverError::Server("there is no transaction in progress".into()))?;
        let mut state = lock(&self.state);
        state.journal.push("ROLLBACK".to_string());
        state.rollbacks += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    unreachable: bool,
    credentials: Option<(String, String)>,
    connect_attempts: u32,
    queues: HashMap<String, (bool, VecDeque<Vec<u8>>)>,
    exchanges: HashMap<String, String>,
    bindings: Vec<(String, String, String)>,
}

/// In-process message broker with direct, fanout and topic routing
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections with these credentials
    pub fn with_credentials(user: &str, password: &str) -> Self {
        let broker = Self::new();
        lock(&broker.state).credentials = Some((user.to_string(), password.to_string()));
        broker
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map_or(0, |(_, messages)| messages.len())
    }
}

impl Broker for MemoryBroker {
    fn connect(
        &self,
        params: &BrokerParams,
        _timeout: Duration,
    ) -> Result<Box<dyn BrokerConnection>, DriverError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused by {}:{}", params.host, params.port),
            )));
        }
        if let Some((user, password)) = &state.credentials {
            if *user != params.user || *password != params.password {
                return Err(DriverError::Server(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    params.user
                )));
            }
        }
        Ok(Box::new(MemoryBrokerConnection {
            state: Some(Arc::clone(&self.state)),
        }))
    }
}

struct MemoryBrokerConnection {
    state: Option<Arc<Mutex<BrokerState>>>,
}

impl BrokerConnection for MemoryBrokerConnection {
    fn open_channel(&mut self) -> Result<Box<dyn Channel>, DriverError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| DriverError::Protocol("connection is closed".to_string()))?;
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(state),
        }))
    }

    fn close(&mut self) {
        self.state = None;
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

impl Channel for MemoryChannel {
    fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        match state.queues.get(name) {
            Some((existing, _)) if *existing != durable => Err(DriverError::Server(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), (durable, VecDeque::new()));
                Ok(())
            }
        }
    }

    fn declare_exchange(&mut self, name: &str, kind: &str) -> Result<(), DriverError> {
        if !matches!(kind, "direct" | "fanout" | "topic") {
            return Err(DriverError::Server(format!(
                "COMMAND_INVALID - unknown exchange type '{}'",
                kind
            )));
        }
        let mut state = lock(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => Err(DriverError::Server(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind.to_string());
                Ok(())
            }
        }
    }

    fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(DriverError::Server(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(DriverError::Server(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<usize, DriverError> {
        let mut state = lock(&self.state);

        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange routes by queue name
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let kind = state.exchanges.get(exchange).cloned().ok_or_else(|| {
                DriverError::Server(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            state
                .bindings
                .iter()
                .filter(|(_, bound_exchange, key)| {
                    bound_exchange == exchange
                        && match kind.as_str() {
                            "fanout" => true,
                            "topic" => topic_matches(key, routing_key),
                            _ => key == routing_key,
                        }
                })
                .map(|(queue, _, _)| queue.clone())
                .collect()
        };

        for queue in &targets {
            if let Some((_, messages)) = state.queues.get_mut(queue) {
                messages.push_back(payload.to_vec());
            }
        }
        Ok(targets.len())
    }

    fn consume(&mut self, queue: &str) -> Result<Option<Vec<u8>>, DriverError> {
        let mut state = lock(&self.state);
        let (_, messages) = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| DriverError::Server(format!("NOT_FOUND - no queue '{}'", queue)))?;
        Ok(messages.pop_front())
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_params() -> DatabaseParams {
        DatabaseParams {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            username: "svc".into(),
            password: "pw".into(),
            ssl_mode: "disable".into(),
        }
    }

    fn broker_params(user: &str, password: &str) -> BrokerParams {
        BrokerParams {
            host: "localhost".into(),
            port: 5672,
            user: user.into(),
            password: password.into(),
            vhost: "/".into(),
        }
    }

    #[test]
    fn test_database_commit_and_rollback() {
        let db = MemoryDatabase::new();
        let mut session = db.connect(&db_params(), Duration::from_secs(1)).unwrap();

        session.execute("CREATE TABLE t").unwrap();
        session.begin().unwrap();
        session.execute("INSERT 1").unwrap();
        session.commit().unwrap();
        session.begin().unwrap();
        session.execute("INSERT 2").unwrap();
        session.rollback().unwrap();

        assert_eq!(db.committed(), vec!["CREATE TABLE t", "INSERT 1"]);
        assert_eq!(db.rollbacks(), 1);
        assert!(session.begin().is_ok());
        assert!(session.begin().is_err());
    }

    #[test]
    fn test_database_unreachable_counts_attempts() {
        let db = MemoryDatabase::unreachable();
        for _ in 0..3 {
            assert!(db.connect(&db_params(), Duration::from_secs(1)).is_err());
        }
        assert_eq!(db.connect_attempts(), 3);
    }

    #[test]
    fn test_broker_direct_and_default_routing() {
        let broker = MemoryBroker::new();
        let mut connection = broker
            .connect(&broker_params("guest", "guest"), Duration::from_secs(1))
            .unwrap();
        let mut channel = connection.open_channel().unwrap();

        channel.declare_queue("jobs", true).unwrap();
        channel.declare_exchange("work", "direct").unwrap();
        channel.bind_queue("jobs", "work", "job.created").unwrap();

        assert_eq!(channel.publish("work", "job.created", b"a").unwrap(), 1);
        assert_eq!(channel.publish("work", "other", b"b").unwrap(), 0);
        assert_eq!(channel.publish("", "jobs", b"c").unwrap(), 1);

        assert_eq!(broker.queue_depth("jobs"), 2);
        assert_eq!(channel.consume("jobs").unwrap(), Some(b"a".to_vec()));
        assert_eq!(channel.consume("jobs").unwrap(), Some(b"c".to_vec()));
        assert_eq!(channel.consume("jobs").unwrap(), None);
        assert!(channel.consume("missing").is_err());
    }

    #[test]
    fn test_broker_redeclare_with_different_args_fails() {
        let broker = MemoryBroker::new();
        let mut connection = broker
            .connect(&broker_params("guest", "guest"), Duration::from_secs(1))
            .unwrap();
        let mut channel = connection.open_channel().unwrap();
        channel.declare_queue("jobs", true).unwrap();
        assert!(channel.declare_queue("jobs", true).is_ok());
        assert!(channel.declare_queue("jobs", false).is_err());
        assert!(channel.declare_exchange("x", "headers").is_err());
    }

    #[test]
    fn test_broker_rejects_bad_credentials() {
        let broker = MemoryBroker::with_credentials("app", "secret");
        assert!(broker
            .connect(&broker_params("app", "wrong"), Duration::from_secs(1))
            .is_err());
        assert!(broker
            .connect(&broker_params("app", "secret"), Duration::from_secs(1))
            .is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("invoice.*", "order.created"));
    }

    #[test]
    fn test_closed_connection_cannot_open_channels() {
        let broker = MemoryBroker::new();
        let mut connection = broker
            .connect(&broker_params("guest", "guest"), Duration::from_secs(1))
            .unwrap();
        connection.close();
        assert!(connection.open_channel().is_err());
    }
}
