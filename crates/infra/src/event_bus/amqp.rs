//! RabbitMQ implementation of the broker seam, built on `lapin`.
//!
//! Connection errors reported by lapin are forwarded as
//! [`ConnectionSignal::Shutdown`] so the connection manager can reconnect.
//! Channels are opened in publisher-confirm mode: a mandatory publish that the
//! broker returns as unroutable fails with [`BrokerError::Unroutable`].

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_stream::StreamExt;
use tracing::debug;

use super::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionSignal, Connector, Delivery,
    DeliveryStream, PublishOptions, QueueOptions, SignalSender,
};
use crate::config::EventBusConfig;

const REPLY_SUCCESS: u16 = 200;

fn map_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Unreachable(err.to_string())
        }
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed(err.to_string()),
        _ => BrokerError::Protocol(err.to_string()),
    }
}

/// Opens RabbitMQ connections for an `amqp://` URI.
#[derive(Clone)]
pub struct AmqpConnector {
    uri: String,
    endpoint: String,
}

impl std::fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URI carries credentials.
        f.debug_struct("AmqpConnector")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl AmqpConnector {
    pub fn from_config(config: &EventBusConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            endpoint: format!("{}:{}", config.host, config.port),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        signals: SignalSender,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(map_error)?;

        let on_error = signals.clone();
        connection.on_error(move |err| {
            on_error.send(ConnectionSignal::Shutdown(err.to_string()));
        });

        debug!(endpoint = %self.endpoint, "AMQP connection opened");
        Ok(Arc::new(AmqpConnection {
            inner: connection,
            endpoint: self.endpoint.clone(),
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    endpoint: String,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(map_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;
        Ok(Box::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "Goodbye")
            .await
            .map_err(map_error)
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_direct_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if options.persistent { 2 } else { 1 })
            .with_content_type(options.content_type.into());

        let confirmation = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .map_err(map_error)?
            .await
            .map_err(map_error)?;

        match confirmation {
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable(routing_key.to_owned())),
            Confirmation::Nack(_) => Err(BrokerError::Protocol(format!(
                "broker rejected message with routing key '{routing_key}'"
            ))),
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(Box::pin(consumer.map(|delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    body: delivery.data,
                    redelivered: delivery.redelivered,
                })
                .map_err(map_error)
        })))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)
    }
}
