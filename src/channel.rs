// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Seams
//!
//! Consumers and publishers never talk to `lapin` directly. They go through the
//! [`BrokerConnection`] and [`BrokerChannel`] traits, which expose exactly the
//! broker operations the topology and delivery layer needs. The `lapin`
//! implementations live here as well, together with a helper that opens a
//! connection from [`RabbitMQConfigs`].
//!
//! A channel is not reentrant: each consumer or publisher owns its own one.

use crate::{
    configs::RabbitMQConfigs,
    consumer::Delivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::Confirmation,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Live sequence of deliveries produced by a consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Resolves once the broker acknowledges (or rejects) one specific publish.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// An open logical connection to the broker, shared by every role built on it.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new multiplexed channel over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A single broker session. All declares are idempotent: declaring an entity
/// that already exists with the same attributes is a no-op, mismatching
/// attributes fail.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Registers `tag` as a manual-ack receiver on `queue`.
    async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError>;

    /// Puts the channel in confirm mode; from then on every publish is
    /// acknowledged by the broker.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Sends a message and hands back the future of its own confirmation.
    ///
    /// Outside confirm mode the future resolves immediately with
    /// [`Confirmation::NotRequested`].
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmFuture, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens a connection to RabbitMQ using the given configuration.
///
/// No retry is attempted; a failure is reported once to the caller.
pub async fn new_amqp_connection(cfg: &RabbitMQConfigs) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    match Connection::connect(&cfg.uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(Arc::new(conn))
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }
}

#[async_trait]
impl BrokerConnection for Connection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }
    }
}

/// Mirrors the publish sequence number the broker assigns in confirm mode.
///
/// A number is taken only once the send went through, and sends are
/// serialized so numbers follow the order publishes reach the channel.
#[derive(Debug, Default)]
struct PublishSequence {
    last: Mutex<u64>,
}

impl PublishSequence {
    /// Runs `send`; when `numbered` the successful send gets the next
    /// number, otherwise `0`.
    async fn send<T, E>(
        &self,
        numbered: bool,
        send: impl Future<Output = Result<T, E>>,
    ) -> Result<(T, u64), E> {
        let mut last = self.last.lock().await;
        let sent = send.await?;

        if !numbered {
            return Ok((sent, 0));
        }

        *last += 1;
        Ok((sent, *last))
    }
}

/// `lapin` backed [`BrokerChannel`].
///
/// Tracks the publish sequence number the broker assigns in confirm mode so
/// confirmations can be reported with their delivery tag.
pub struct AmqpChannel {
    channel: Channel,
    confirm_mode: AtomicBool,
    sequence: PublishSequence,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> AmqpChannel {
        AmqpChannel {
            channel,
            confirm_mode: AtomicBool::new(false),
            sequence: PublishSequence::default(),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, tag, "error to create the consumer");
                AmqpError::ConsumerRegistrationError(tag.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result.map(Delivery::from).map_err(|err| {
                    error!(error = err.to_string(), "errors consume msg");
                    AmqpError::ConsumerError(err.to_string())
                })
            })
            .boxed())
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(tag.to_owned())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable confirm mode");
                AmqpError::ConfirmModeError
            })?;

        self.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmFuture, AmqpError> {
        let publish = self.channel.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: false,
                immediate: false,
            },
            payload,
            properties,
        );

        let (confirm, delivery_tag) = self
            .sequence
            .send(self.confirm_mode.load(Ordering::SeqCst), publish)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_ack() => {
                    Ok(Confirmation::Ack { delivery_tag })
                }
                Ok(confirmation) if confirmation.is_nack() => {
                    Ok(Confirmation::Nack { delivery_tag })
                }
                Ok(_) => Ok(Confirmation::NotRequested),
                Err(err) => {
                    error!(error = err.to_string(), delivery_tag, "error waiting confirmation");
                    Err(AmqpError::PublishingError)
                }
            }
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the channel");
            AmqpError::ChannelError
        })
    }
}
