use preflight::drivers::{MemoryBroker, MemoryDatabase};
use preflight::error::InitError;
use preflight::initializers::{
    DatabaseInitializer, FileSystemInitializer, NetworkInitializer, QueueInitializer,
};
use preflight::report::HealthReport;
use preflight::{BootstrapConfig, Initializer, ManagerOptions, State, StateManager};
use std::net::TcpListener;
use std::path::Path;
use tempfile::TempDir;
use toml::Table;

fn storage(base: &Path) -> FileSystemInitializer {
    let config: Table = format!(
        "base_path = \"{}\"\nrequired_dirs = [\"cache\", \"logs\"]",
        base.display()
    )
    .parse()
    .unwrap();
    FileSystemInitializer::new("storage", config)
}

fn database(db: &MemoryDatabase, extra: &str) -> DatabaseInitializer {
    let config: Table = format!(
        "host = \"db.local\"\nport = 5432\ndatabase = \"app\"\nusername = \"app\"\npassword = \"\"\n{}",
        extra
    )
    .parse()
    .unwrap();
    DatabaseInitializer::with_driver("database", config, Box::new(db.clone()))
}

fn queue(broker: &MemoryBroker) -> QueueInitializer {
    let config: Table = r#"
host = "mq.local"
port = 5672
user = "guest"
password = "guest"
queues = [{ name = "jobs" }]
exchanges = [{ name = "events", kind = "fanout" }]
bindings = [{ queue = "jobs", exchange = "events" }]
"#
    .parse()
    .unwrap();
    QueueInitializer::with_broker("events", config, Box::new(broker.clone()))
}

#[test]
fn test_full_bootstrap_in_dependency_order() {
    let dir = TempDir::new().unwrap();
    let db = MemoryDatabase::new();
    let broker = MemoryBroker::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let network_config: Table = format!(
        "[connections.upstream]\nhost = \"127.0.0.1\"\nport = {}",
        listener.local_addr().unwrap().port()
    )
    .parse()
    .unwrap();

    let mut events = queue(&broker);
    events.depends_on("database");
    let mut db_init = database(&db, "");
    db_init.depends_on("storage");
    let mut network = NetworkInitializer::new("network", network_config);
    network.depends_on("storage");

    let mut manager = StateManager::new();
    // Registered out of order on purpose
    manager.register(Box::new(events)).unwrap();
    manager.register(Box::new(network)).unwrap();
    manager.register(Box::new(db_init)).unwrap();
    manager.register(Box::new(storage(dir.path()))).unwrap();

    manager.initialize().unwrap();
    assert!(manager.is_initialized());

    let order = manager.execution_order().to_vec();
    let position = |name: &str| order.iter().position(|o| o == name).unwrap();
    assert_eq!(order.len(), 4);
    assert!(position("storage") < position("database"));
    assert!(position("database") < position("events"));
    assert!(position("storage") < position("network"));

    for (name, status) in manager.statuses() {
        assert_eq!(status.state(), State::Complete, "{} did not complete", name);
    }
    assert!(dir.path().join("cache").is_dir());
    assert!(dir.path().join("logs").is_dir());
    assert!(db.connect_attempts() >= 1);
    assert!(broker.has_queue("jobs"));
    assert!(broker.has_exchange("events"));
    assert!(manager.monitor().count("database", "connection") >= 1);
    assert_eq!(manager.collector().counter("initializers.succeeded"), 4);

    let report = HealthReport::from_manager(&manager);
    assert!(report.healthy);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn test_cycle_is_reported_before_any_io() {
    let dir = TempDir::new().unwrap();
    let db = MemoryDatabase::new();

    let mut db_init = database(&db, "");
    db_init.depends_on("storage");
    let mut fs = storage(dir.path());
    fs.depends_on("database");

    let mut manager = StateManager::new();
    manager.register(Box::new(db_init)).unwrap();
    manager.register(Box::new(fs)).unwrap();

    match manager.initialize() {
        Err(InitError::CircularDependency(e)) => {
            assert_eq!(e.cycle.first(), e.cycle.last());
            assert_eq!(e.cycle.len(), 3);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert_eq!(db.connect_attempts(), 0);
    assert!(!dir.path().join("cache").exists());
    assert!(!manager.is_initialized());
    assert!(manager.status().is_failed());
    for (_, status) in manager.statuses() {
        assert_eq!(status.state(), State::Pending);
    }
}

#[test]
fn test_unreachable_database_stops_before_perform() {
    let dir = TempDir::new().unwrap();
    let db = MemoryDatabase::unreachable();

    let mut manager = StateManager::new();
    manager.register(Box::new(storage(dir.path()))).unwrap();
    manager
        .register(Box::new(database(&db, "retry_attempts = 2\nretry_delay = 0")))
        .unwrap();

    let err = manager.initialize().unwrap_err();
    match &err {
        InitError::Phase {
            component, phase, ..
        } => {
            assert_eq!(component, "database");
            assert_eq!(*phase, "connect");
        }
        other => panic!("expected a phase error, got {:?}", other),
    }
    assert!(matches!(err.root(), InitError::Connection(c) if c.attempts == 2));

    assert_eq!(db.connect_attempts(), 2);
    assert_eq!(manager.monitor().count("database", "connection"), 2);
    assert!(!dir.path().join("cache").exists());
    assert_eq!(
        manager.status().data().get("failed_component"),
        Some(&serde_json::Value::from("database"))
    );

    let report = HealthReport::from_manager(&manager);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_rollback_resets_completed_resources() {
    let db = MemoryDatabase::new();
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    // The endpoint is reachable during the connection test only
    struct Closing {
        inner: NetworkInitializer,
        listener: Option<TcpListener>,
    }

    impl Initializer for Closing {
        fn lifecycle(&self) -> &preflight::initializer::Lifecycle {
            self.inner.lifecycle()
        }
        fn lifecycle_mut(&mut self) -> &mut preflight::initializer::Lifecycle {
            self.inner.lifecycle_mut()
        }
        fn kind(&self) -> &'static str {
            self.inner.kind()
        }
        fn validate_configuration(&mut self) -> Result<(), preflight::ConfigurationError> {
            self.inner.validate_configuration()
        }
        fn test_connection(&mut self) -> Result<bool, InitError> {
            let reachable = self.inner.test_connection();
            drop(self.listener.take());
            reachable
        }
        fn perform_initialization(&mut self) -> Result<(), InitError> {
            self.inner.perform_initialization()
        }
        fn reset(&mut self) {
            self.inner.reset()
        }
    }

    let config: Table = format!(
        "[connections.upstream]\nhost = \"127.0.0.1\"\nport = {}\ntimeout = 1",
        port
    )
    .parse()
    .unwrap();
    let mut network = Closing {
        inner: NetworkInitializer::new("network", config),
        listener: Some(taken),
    };
    network.depends_on("database");

    let mut manager = StateManager::with_options(ManagerOptions {
        rollback_on_failure: true,
        parallel_connection_tests: false,
    });
    manager.register(Box::new(database(&db, ""))).unwrap();
    manager.register(Box::new(network)).unwrap();

    let err = manager.initialize().unwrap_err();
    assert!(matches!(err, InitError::Phase { phase: "perform", .. }));

    let database = manager.get("database").unwrap();
    assert_eq!(database.status().state(), State::Pending);
    assert!(manager.get("network").unwrap().status().is_failed());
    assert_eq!(db.rollbacks(), 0);
}

#[test]
fn test_bootstrap_file_end_to_end() {
    let dir = TempDir::new().unwrap();
    let text = format!(
        r#"
[manager]
parallel_connection_tests = true

[initializers.storage]
type = "filesystem"
base_path = "{}"
required_dirs = ["data"]
permissions = "0750"

[initializers.database]
type = "database"
driver = "memory"
depends_on = ["storage"]
host = "db.local"
port = 5432
database = "app"
username = "app"
password = "secret"

[initializers.events]
type = "queue"
driver = "memory"
depends_on = ["database"]
host = "mq.local"
port = 5672
user = "guest"
password = "guest"
queues = [{{ name = "jobs" }}]
"#,
        dir.path().display()
    );

    let config: BootstrapConfig = text.parse().unwrap();
    let mut manager = config.build_manager().unwrap();
    manager.initialize().unwrap();
    assert_eq!(
        manager.execution_order(),
        ["storage".to_string(), "database".to_string(), "events".to_string()]
    );
    assert!(dir.path().join("data").is_dir());

    let report = HealthReport::from_manager(&manager);
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["healthy"], true);
    assert_eq!(json["initializers"].as_array().unwrap().len(), 3);
    assert_eq!(json["initializers"][1]["type"], "database");
    assert!(!report.to_json().unwrap().contains("secret"));
}

#[test]
fn test_validation_only_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let text = format!(
        "[initializers.storage]\ntype = \"filesystem\"\nbase_path = \"{}\"\nrequired_dirs = [\"data\"]",
        dir.path().display()
    );
    let mut manager = text
        .parse::<BootstrapConfig>()
        .unwrap()
        .build_manager()
        .unwrap();

    manager.validate().unwrap();
    assert!(!dir.path().join("data").exists());
    assert!(!manager.is_initialized());
    assert_eq!(HealthReport::from_manager(&manager).exit_code(), 0);
}
