//! AMQP 0-9-1 broker driver backed by lapin
//!
//! Connections authenticate with the configured user against the virtual
//! host. Channels are opened in confirm mode and publish with the mandatory
//! flag, so an unroutable message comes back instead of vanishing.

use crate::drivers::{Broker, BrokerConnection, BrokerParams, Channel};
use crate::error::DriverError;
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use log::debug;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Connection URI for the broker with credentials and virtual host
pub fn amqp_uri(params: &BrokerParams) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.userinfo.username = params.user.clone();
    uri.authority.userinfo.password = params.password.clone();
    uri.authority.host = params.host.clone();
    uri.authority.port = params.port;
    uri.vhost = params.vhost.clone();
    uri
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Opens AMQP connections
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBroker;

impl Broker for AmqpBroker {
    fn connect(
        &self,
        params: &BrokerParams,
        timeout: Duration,
    ) -> Result<Box<dyn BrokerConnection>, DriverError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let connection = block_on(
            &runtime,
            timeout,
            Connection::connect_uri(amqp_uri(params), ConnectionProperties::default()),
        )?;
        debug!(
            "Opened AMQP connection to {}:{} vhost {}",
            params.host, params.port, params.vhost
        );
        Ok(Box::new(AmqpConnection {
            runtime: Arc::new(runtime),
            connection: Some(connection),
            timeout,
        }))
    }
}

struct AmqpConnection {
    runtime: Arc<Runtime>,
    connection: Option<Connection>,
    timeout: Duration,
}

impl BrokerConnection for AmqpConnection {
    fn open_channel(&mut self) -> Result<Box<dyn Channel>, DriverError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| DriverError::Protocol("connection is closed".to_string()))?;
        let channel = block_on(&self.runtime, self.timeout, connection.create_channel())?;
        block_on(
            &self.runtime,
            self.timeout,
            channel.confirm_select(ConfirmSelectOptions::default()),
        )?;
        Ok(Box::new(AmqpChannel {
            runtime: Arc::clone(&self.runtime),
            channel,
            timeout: self.timeout,
        }))
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = block_on(&self.runtime, self.timeout, connection.close(200, "bye")) {
                debug!("AMQP connection did not close cleanly: {}", e);
            }
        }
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct AmqpChannel {
    runtime: Arc<Runtime>,
    channel: lapin::Channel,
    timeout: Duration,
}

impl AmqpChannel {
    fn run<T, F>(&self, future: F) -> Result<T, DriverError>
    where
        F: Future<Output = lapin::Result<T>>,
    {
        block_on(&self.runtime, self.timeout, future)
    }
}

impl Channel for AmqpChannel {
    fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DriverError> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        self.run(self.channel.queue_declare(name, options, FieldTable::default()))
            .map(|_| ())
    }

    fn declare_exchange(&mut self, name: &str, kind: &str) -> Result<(), DriverError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.run(self.channel.exchange_declare(
            name,
            exchange_kind(kind),
            options,
            FieldTable::default(),
        ))
    }

    fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DriverError> {
        self.run(self.channel.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        ))
    }

    /// Brokers do not report fan-out, so a routed message counts as one
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<usize, DriverError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };
        let confirmation = self.run(async {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    options,
                    payload,
                    BasicProperties::default(),
                )
                .await?
                .await
        })?;
        match confirmation {
            Confirmation::Ack(returned) => Ok(if returned.is_some() { 0 } else { 1 }),
            Confirmation::Nack(_) => Err(DriverError::Server(format!(
                "broker refused message for exchange '{}'",
                exchange
            ))),
            Confirmation::NotRequested => Ok(1),
        }
    }

    fn consume(&mut self, queue: &str) -> Result<Option<Vec<u8>>, DriverError> {
        let message = self.run(
            self.channel
                .basic_get(queue, BasicGetOptions { no_ack: true }),
        )?;
        Ok(message.map(|message| message.delivery.data))
    }
}

/// Run `future` to completion on `runtime`, bounded by `timeout`
fn block_on<T, F>(runtime: &Runtime, timeout: Duration, future: F) -> Result<T, DriverError>
where
    F: Future<Output = lapin::Result<T>>,
{
    match runtime.block_on(async { tokio::time::timeout(timeout, future).await }) {
        Ok(result) => result.map_err(|e| DriverError::Server(e.to_string())),
        Err(_) => Err(DriverError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer from the broker within {:?}", timeout),
        ))),
    }
}
