//! Message broker initializer
//!
//! Declares the configured exchanges, queues and bindings once the broker is
//! reachable, then keeps a channel open for publishing and consuming.

use crate::drivers::{AmqpBroker, Broker, BrokerConnection, BrokerParams, Channel};
use crate::error::{ConfigurationError, DriverError, InitError, ResourceError};
use crate::initializer::settings::{self, nested};
use crate::initializer::{Initializer, Lifecycle, RetryPolicy};
use crate::initializers::validated;
use log::{debug, info};
use std::time::Duration;
use toml::Table;

const EXCHANGE_KINDS: [&str; 4] = ["direct", "fanout", "topic", "headers"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueSpec {
    name: String,
    durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExchangeSpec {
    name: String,
    kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingSpec {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct QueueSettings {
    params: BrokerParams,
    timeout: Duration,
    retry: RetryPolicy,
    queues: Vec<QueueSpec>,
    exchanges: Vec<ExchangeSpec>,
    bindings: Vec<BindingSpec>,
}

impl QueueSettings {
    fn parse(config: &Table) -> Result<Self, ConfigurationError> {
        let params = BrokerParams {
            host: settings::required_str(config, "host")?,
            port: settings::port(config, "port", None)?,
            user: settings::required_str(config, "user")?,
            password: settings::required_secret(config, "password")?,
            vhost: settings::optional_str(config, "vhost")?.unwrap_or_else(|| "/".to_string()),
        };
        let timeout = settings::seconds(config, "timeout", 10.0, false)?;
        let attempts = settings::integer_in_range(config, "retry_attempts", Some(3), 1, 100)?;
        let delay = settings::seconds(config, "retry_delay", 1.0, true)?;

        let queues = settings::table_list(config, "queues", |t, field| {
            Ok(QueueSpec {
                name: settings::required_str(t, "name").map_err(|e| nested(e, field))?,
                durable: settings::optional_bool(t, "durable", true).map_err(|e| nested(e, field))?,
            })
        })?;

        let exchanges = settings::table_list(config, "exchanges", |t, field| {
            let name = settings::required_str(t, "name").map_err(|e| nested(e, field))?;
            let kind = settings::optional_str(t, "kind")
                .map_err(|e| nested(e, field))?
                .unwrap_or_else(|| "direct".to_string());
            if !EXCHANGE_KINDS.contains(&kind.as_str()) {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("{}.kind", field),
                    reason: format!("'{}' is not one of {}", kind, EXCHANGE_KINDS.join(", ")),
                });
            }
            Ok(ExchangeSpec { name, kind })
        })?;

        let bindings = settings::table_list(config, "bindings", |t, field| {
            let binding = BindingSpec {
                queue: settings::required_str(t, "queue").map_err(|e| nested(e, field))?,
                exchange: settings::required_str(t, "exchange").map_err(|e| nested(e, field))?,
                routing_key: settings::optional_str(t, "routing_key")
                    .map_err(|e| nested(e, field))?
                    .unwrap_or_default(),
            };
            if !queues.iter().any(|q| q.name == binding.queue) {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("{}.queue", field),
                    reason: format!("queue '{}' is not declared", binding.queue),
                });
            }
            if !exchanges.iter().any(|x| x.name == binding.exchange) {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("{}.exchange", field),
                    reason: format!("exchange '{}' is not declared", binding.exchange),
                });
            }
            Ok(binding)
        })?;

        Ok(Self {
            params,
            timeout,
            retry: RetryPolicy::new(attempts as u32, delay),
            queues,
            exchanges,
            bindings,
        })
    }

    fn target(&self) -> String {
        format!(
            "{}:{}{}",
            self.params.host, self.params.port, self.params.vhost
        )
    }
}

/// An open connection with its channel; closed on drop
struct BrokerSession {
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn Channel>,
}

impl BrokerSession {
    fn open(broker: &dyn Broker, settings: &QueueSettings) -> Result<Self, DriverError> {
        let mut connection = broker.connect(&settings.params, settings.timeout)?;
        let channel = connection.open_channel()?;
        Ok(Self {
            connection,
            channel,
        })
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// Connects to a message broker and declares its topology
pub struct QueueInitializer {
    lifecycle: Lifecycle,
    config: Table,
    settings: Option<QueueSettings>,
    broker: Box<dyn Broker>,
    session: Option<BrokerSession>,
}

impl QueueInitializer {
    /// Create an initializer using the AMQP broker client
    pub fn new(name: &str, config: Table) -> Self {
        Self::with_broker(name, config, Box::new(AmqpBroker))
    }

    pub fn with_broker(name: &str, config: Table, broker: Box<dyn Broker>) -> Self {
        Self {
            lifecycle: Lifecycle::new(name, "queue"),
            config,
            settings: None,
            broker,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn channel(&mut self) -> Result<&mut dyn Channel, ResourceError> {
        let component = self.lifecycle.name().to_string();
        match self.session.as_mut() {
            Some(session) => Ok(session.channel.as_mut()),
            None => Err(ResourceError::NotInitialized { component }),
        }
    }

    fn driver_error(&self, e: DriverError) -> InitError {
        ResourceError::Driver {
            component: self.lifecycle.name().to_string(),
            message: e.to_string(),
        }
        .into()
    }

    /// Publish a message; returns the number of queues it was routed to
    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<usize, InitError> {
        let result = self.channel()?.publish(exchange, routing_key, payload);
        result.map_err(|e| self.driver_error(e))
    }

    /// Take the next message from `queue`, if any
    pub fn consume(&mut self, queue: &str) -> Result<Option<Vec<u8>>, InitError> {
        let result = self.channel()?.consume(queue);
        result.map_err(|e| self.driver_error(e))
    }

    fn declare(
        component: &str,
        channel: &mut dyn Channel,
        settings: &QueueSettings,
    ) -> Result<(), ResourceError> {
        let fail = |what: String, e: DriverError| ResourceError::Driver {
            component: component.to_string(),
            message: format!("{} failed: {}", what, e),
        };

        for exchange in &settings.exchanges {
            channel
                .declare_exchange(&exchange.name, &exchange.kind)
                .map_err(|e| fail(format!("declaring exchange '{}'", exchange.name), e))?;
            debug!("{}: declared {} exchange '{}'", component, exchange.kind, exchange.name);
        }
        for queue in &settings.queues {
            channel
                .declare_queue(&queue.name, queue.durable)
                .map_err(|e| fail(format!("declaring queue '{}'", queue.name), e))?;
            debug!("{}: declared queue '{}'", component, queue.name);
        }
        for binding in &settings.bindings {
            channel
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .map_err(|e| {
                    fail(
                        format!("binding '{}' to '{}'", binding.queue, binding.exchange),
                        e,
                    )
                })?;
        }
        Ok(())
    }
}

impl Initializer for QueueInitializer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn kind(&self) -> &'static str {
        "queue"
    }

    fn validate_configuration(&mut self) -> Result<(), ConfigurationError> {
        let parsed = QueueSettings::parse(&self.config);
        self.settings = parsed.as_ref().ok().cloned();
        self.lifecycle.record_validation(parsed.map(|_| ()))
    }

    fn test_connection(&mut self) -> Result<bool, InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        let broker = self.broker.as_ref();
        let result = self
            .lifecycle
            .connect_with_retry(&settings.target(), settings.retry, || {
                BrokerSession::open(broker, &settings)
            });
        Ok(result.is_ok())
    }

    fn perform_initialization(&mut self) -> Result<(), InitError> {
        let settings = validated(&self.lifecycle, &self.settings)?.clone();
        self.session = None;

        let broker = self.broker.as_ref();
        let session = self.lifecycle.perform(|lifecycle| {
            let mut session = lifecycle.retry(&settings.target(), settings.retry, || {
                BrokerSession::open(broker, &settings)
            })?;
            Self::declare(lifecycle.name(), session.channel.as_mut(), &settings)?;

            let status = lifecycle.status_mut();
            status.add_data("queues", settings.queues.len());
            status.add_data("exchanges", settings.exchanges.len());
            status.add_data("bindings", settings.bindings.len());
            Ok(session)
        })?;
        info!(
            "{}: broker topology ready on {}",
            self.lifecycle.name(),
            settings.target()
        );
        self.session = Some(session);
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
    use crate::drivers::{MemoryBroker, MockBroker, MockBrokerConnection, MockChannel};

    const BASE: &str = "host = \"127.0.0.1\"\nport = 5672\nuser = \"guest\"\npassword = \"guest\"\nretry_delay = 0\n";

    const TOPOLOGY: &str = r#"
[[exchanges]]
name = "events"
kind = "topic"

[[queues]]
name = "audit"

[[queues]]
name = "scratch"
durable = false

[[bindings]]
queue = "audit"
exchange = "events"
routing_key = "user.#"
"#;

    fn config(extra: &str) -> Table {
        format!("{}{}", BASE, extra).parse().unwrap()
    }

    #[test]
    fn test_validation_defaults_and_topology() {
        let mut init = QueueInitializer::new("queue", config(TOPOLOGY));
        init.validate_configuration().unwrap();
        let settings = init.settings.as_ref().unwrap();
        assert_eq!(settings.params.vhost, "/");
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.queues.len(), 2);
        assert!(settings.queues[0].durable);
        assert!(!settings.queues[1].durable);
        assert_eq!(settings.bindings[0].routing_key, "user.#");
    }

    #[test]
    fn test_validation_rejects_dangling_binding() {
        let extra = "[[queues]]\nname = \"audit\"\n\n[[bindings]]\nqueue = \"audit\"\nexchange = \"missing\"\n";
        let mut init = QueueInitializer::new("queue", config(extra));
        assert_eq!(
            init.validate_configuration().unwrap_err().field(),
            "bindings[0].exchange"
        );
    }

    #[test]
    fn test_validation_rejects_unknown_exchange_kind() {
        let extra = "[[exchanges]]\nname = \"x\"\nkind = \"broadcast\"\n";
        let mut init = QueueInitializer::new("queue", config(extra));
        assert_eq!(
            init.validate_configuration().unwrap_err().field(),
            "exchanges[0].kind"
        );
    }

    #[test]
    fn test_validation_requires_credentials() {
        let table: Table = "host = \"mq\"\nport = 5672\nuser = \"guest\"".parse().unwrap();
        let mut init = QueueInitializer::new("queue", table);
        assert_eq!(init.validate_configuration().unwrap_err().field(), "password");
    }

    #[test]
    fn test_perform_declares_topology_and_routes() {
        let broker = MemoryBroker::new();
        let mut init = QueueInitializer::with_broker("queue", config(TOPOLOGY), Box::new(broker.clone()));
        init.validate_configuration().unwrap();
        assert!(init.test_connection().unwrap());
        init.perform_initialization().unwrap();

        assert!(init.status().is_success());
        assert!(broker.has_exchange("events"));
        assert!(broker.has_queue("audit"));
        assert!(broker.has_queue("scratch"));

        assert_eq!(init.publish("events", "user.created", b"42").unwrap(), 1);
        assert_eq!(init.publish("events", "order.created", b"7").unwrap(), 0);
        assert_eq!(broker.queue_depth("audit"), 1);
        assert_eq!(init.consume("audit").unwrap(), Some(b"42".to_vec()));
        assert_eq!(init.consume("audit").unwrap(), None);

        init.reset();
        assert!(matches!(
            init.publish("events", "user.created", b"x"),
            Err(InitError::Resource(ResourceError::NotInitialized { .. }))
        ));
    }

    #[test]
    fn test_wrong_credentials_fail_connection() {
        let broker = MemoryBroker::with_credentials("admin", "secret");
        let mut init = QueueInitializer::with_broker(
            "queue",
            config("retry_attempts = 2"),
            Box::new(broker.clone()),
        );
        init.validate_configuration().unwrap();
        assert!(!init.test_connection().unwrap());
        assert_eq!(broker.connect_attempts(), 2);
        assert!(init.status().errors()[0].contains("ACCESS_REFUSED"));
    }

    #[test]
    fn test_declare_failure_is_resource_error() {
        let mut channel = MockChannel::new();
        channel
            .expect_declare_exchange()
            .returning(|_, _| Ok(()));
        channel.expect_declare_queue().returning(|name, _| {
            Err(DriverError::Server(format!(
                "ACCESS_REFUSED - access to queue '{}' refused",
                name
            )))
        });
        let mut connection = MockBrokerConnection::new();
        connection
            .expect_open_channel()
            .return_once(move || Ok(Box::new(channel) as Box<dyn Channel>));
        connection.expect_close().times(1).return_const(());
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .return_once(move |_, _| Ok(Box::new(connection) as Box<dyn BrokerConnection>));

        let mut init = QueueInitializer::with_broker("queue", config(TOPOLOGY), Box::new(broker));
        init.validate_configuration().unwrap();
        let err = init.perform_initialization().unwrap_err();
        assert!(matches!(err, InitError::Resource(ResourceError::Driver { .. })));
        assert!(err.to_string().contains("declaring queue 'audit'"));
        assert!(init.status().is_failed());
        assert!(!init.is_connected());
    }
}
