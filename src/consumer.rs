// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] owns one channel, provisions its queue topology (including
//! the dead-letter path) on construction and hands out a live sequence of
//! [`Delivery`] values. Acknowledging each delivery is left to the caller.
//!
//! There is no backpressure beyond the broker client's delivery buffer; a slow
//! reader against a fast producer grows that buffer.

use crate::{
    channel::{BrokerChannel, BrokerConnection, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::{DeadLetterDefinition, Topology, TopologyProvisioner, WILDCARD_BINDING_KEY},
};
#[cfg(any(test, feature = "mocks"))]
use crate::mocks::InMemorySettler;
use futures_util::{
    stream::{Fuse, Stream},
    StreamExt,
};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    protocol::basic::AMQPProperties,
};
use opentelemetry::Context;
use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{self, Poll},
};
use tracing::{debug, error, warn};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Reject,
    Requeue,
}

enum Settler {
    Amqp(Acker),
    #[cfg(any(test, feature = "mocks"))]
    InMemory(InMemorySettler),
}

/// One inbound message plus the handle used to settle it.
///
/// Every delivery must eventually be acked, rejected or requeued, and only
/// once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub data: Vec<u8>,
    settler: Settler,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            settler: Settler::Amqp(delivery.acker),
        }
    }
}

impl Delivery {
    #[cfg(any(test, feature = "mocks"))]
    pub(crate) fn in_memory(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: AMQPProperties,
        data: &[u8],
        settler: InMemorySettler,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data: data.to_vec(),
            settler: Settler::InMemory(settler),
        }
    }

    /// Trace context propagated by the publisher through the message headers.
    pub fn trace_context(&self) -> Context {
        otel::extract_context(&self.properties)
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Ack).await.map_err(|err| {
            error!(error = err.as_str(), "error whiling ack msg");
            AmqpError::AckMessageError
        })
    }

    /// Rejects the message without requeue; the broker dead-letters it.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Reject).await.map_err(|err| {
            error!(error = err.as_str(), "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }

    /// Returns the message to its queue for redelivery.
    pub async fn requeue(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Requeue).await.map_err(|err| {
            error!(error = err.as_str(), "error whiling requeuing");
            AmqpError::RequeuingMessageError
        })
    }

    async fn settle(&self, outcome: Settlement) -> Result<(), String> {
        match &self.settler {
            Settler::Amqp(acker) => {
                let settled = match outcome {
                    Settlement::Ack => acker.ack(BasicAckOptions { multiple: false }).await,
                    Settlement::Reject => {
                        acker.reject(BasicRejectOptions { requeue: false }).await
                    }
                    Settlement::Requeue => {
                        acker
                            .nack(BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            })
                            .await
                    }
                };
                settled.map_err(|err| err.to_string())
            }
            #[cfg(any(test, feature = "mocks"))]
            Settler::InMemory(settler) => settler.settle(outcome),
        }
    }
}

/// Lazy, unbounded sequence of deliveries from one consumer registration.
///
/// Not restartable: once it yields `None` it keeps yielding `None`. Reaching
/// the end or dropping it releases the registration, and the consumer may
/// then register again.
pub struct Deliveries {
    inner: Fuse<DeliveryStream>,
    registration: Registration,
}

impl Deliveries {
    fn new(stream: DeliveryStream, registration: Registration) -> Deliveries {
        Deliveries {
            inner: stream.fuse(),
            registration,
        }
    }
}

impl Stream for Deliveries {
    type Item = Result<Delivery, AmqpError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let next = self.inner.poll_next_unpin(cx);

        // the broker ended the subscription, nothing is left to cancel
        if let Poll::Ready(None) = next {
            self.registration.release(false);
        }

        next
    }
}

/// Everything a consumer needs to provision and identify itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) exchange: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) binding_key: String,
    pub(crate) dead_letter: DeadLetterDefinition,
}

impl ConsumerDefinition {
    /// Defaults to binding the queue with `*` and the `dead_letter` path.
    pub fn new(exchange: &str, kind: ExchangeKind, queue: &str, tag: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            exchange: exchange.to_owned(),
            kind,
            queue: queue.to_owned(),
            tag: tag.to_owned(),
            binding_key: WILDCARD_BINDING_KEY.to_owned(),
            dead_letter: DeadLetterDefinition::default(),
        }
    }

    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_key = key.to_owned();
        self
    }

    pub fn dead_letter(mut self, def: DeadLetterDefinition) -> Self {
        self.dead_letter = def;
        self
    }

    fn validate(&self) -> Result<(), AmqpError> {
        if self.tag.trim().is_empty() {
            return Err(AmqpError::InvalidDefinition(
                "consumer tag must not be empty".to_owned(),
            ));
        }

        if self.binding_key.is_empty() {
            return Err(AmqpError::InvalidDefinition(
                "binding key must not be empty".to_owned(),
            ));
        }

        Ok(())
    }

    /// Dead-letter path, application exchange, application queue wired to
    /// the dead-letter exchange, then the queue binding.
    pub(crate) fn topology(&self, channel: Arc<dyn BrokerChannel>) -> TopologyProvisioner {
        TopologyProvisioner::new(channel)
            .dead_letter(self.dead_letter.clone())
            .exchange(
                ExchangeDefinition::new(&self.exchange)
                    .kind(self.kind.clone())
                    .durable(),
            )
            .queue(
                QueueDefinition::new(&self.queue)
                    .durable()
                    .dead_letter(self.dead_letter.name()),
            )
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(&self.binding_key),
            )
    }
}

/// Lifecycle of a consumer's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Topology provisioned, no live subscription.
    Open,
    /// A subscription is registered, or being registered, on the broker.
    Active,
    /// Channel released; the consumer cannot be used anymore.
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConsumerState,
    /// Bumped on every registration so a stale release is ignored.
    registration: u64,
    /// A released subscription may still be live on the broker.
    dangling: bool,
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns the consumer to `Open` once its registration is over.
struct Registration {
    lifecycle: Arc<Mutex<Lifecycle>>,
    id: u64,
    released: bool,
}

impl Registration {
    fn release(&mut self, dangling: bool) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == ConsumerState::Active && lifecycle.registration == self.id {
            lifecycle.state = ConsumerState::Open;
            lifecycle.dangling = dangling;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release(true);
    }
}

pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    tag: String,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl Consumer {
    /// Opens a channel and provisions the consumer topology on it.
    ///
    /// Any failing declare or bind aborts construction; the channel is closed
    /// and entities declared so far stay on the broker.
    pub async fn new(
        conn: &dyn BrokerConnection,
        def: ConsumerDefinition,
    ) -> Result<Consumer, AmqpError> {
        def.validate()?;

        debug!("got connection, getting channel");
        let channel = conn.open_channel().await?;

        if let Err(err) = def.topology(channel.clone()).install().await {
            if let Err(close_err) = channel.close().await {
                warn!(
                    error = close_err.to_string(),
                    "error to release channel after failed provisioning"
                );
            }
            return Err(err);
        }

        debug!(tag = def.tag.as_str(), queue = def.queue.as_str(), "consumer ready");

        Ok(Consumer {
            channel,
            tag: def.tag,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ConsumerState::Open,
                registration: 0,
                dangling: false,
            })),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> ConsumerState {
        lock(&self.lifecycle).state
    }

    /// Registers on `queue` with manual acknowledgement and returns the live
    /// delivery sequence.
    ///
    /// Only one registration is live at a time. A subscription whose
    /// [`Deliveries`] was dropped is cancelled before registering again.
    pub async fn consume(&self, queue: &str) -> Result<Deliveries, AmqpError> {
        let (mut registration, dangling) = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                ConsumerState::Closed => return Err(AmqpError::ChannelClosed),
                ConsumerState::Active => {
                    return Err(AmqpError::ConsumerAlreadyActive(self.tag.clone()))
                }
                ConsumerState::Open => {}
            }

            lifecycle.state = ConsumerState::Active;
            lifecycle.registration += 1;

            let registration = Registration {
                lifecycle: self.lifecycle.clone(),
                id: lifecycle.registration,
                released: false,
            };
            (registration, std::mem::take(&mut lifecycle.dangling))
        };

        let mut still_dangling = false;
        if dangling {
            if let Err(err) = self.channel.basic_cancel(&self.tag).await {
                warn!(
                    error = err.to_string(),
                    tag = self.tag.as_str(),
                    "error to cancel the released subscription"
                );
                still_dangling = true;
            }
        }

        let stream = match self.channel.basic_consume(queue, &self.tag).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = err.to_string(), queue, "deliveries");
                registration.release(still_dangling);
                return Err(err);
            }
        };

        debug!(tag = self.tag.as_str(), queue, "consuming");

        Ok(Deliveries::new(stream, registration))
    }

    /// Cancels the subscription, if any, then closes the channel.
    ///
    /// The channel is closed even when the cancel fails. Calling it on a
    /// closed consumer is a no-op.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        let previous = {
            let mut lifecycle = lock(&self.lifecycle);
            std::mem::replace(&mut lifecycle.state, ConsumerState::Closed)
        };

        let cancelled = match previous {
            ConsumerState::Closed => return Ok(()),
            ConsumerState::Active => self.channel.basic_cancel(&self.tag).await,
            ConsumerState::Open => Ok(()),
        };

        let closed = self.channel.close().await;
        debug!(tag = self.tag.as_str(), "consumer shutdown");

        cancelled.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ConfirmFuture, MockBrokerChannel, MockBrokerConnection},
        mocks::InMemoryBroker,
        publisher::{Publisher, PublisherDefinition},
        queue::AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        topology::DEAD_LETTER_NAME,
    };
    use async_trait::async_trait;
    use lapin::{types::AMQPValue, BasicProperties};

    fn orders_consumer() -> ConsumerDefinition {
        ConsumerDefinition::new("orders", ExchangeKind::Topic, "orders.new", "c1")
    }

    async fn consumer_on(channel: Arc<dyn BrokerChannel>) -> Consumer {
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel()
            .times(1)
            .returning(move || Ok(channel.clone()));

        Consumer::new(&conn, orders_consumer()).await.unwrap()
    }

    fn provisioned_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_exchange_declare().returning(|_| Ok(()));
        channel.expect_queue_declare().returning(|_| Ok(()));
        channel.expect_queue_bind().returning(|_| Ok(()));
        channel
    }

    /// Yields once before registering, so two registrations can interleave.
    struct SlowRegistration {
        inner: Arc<dyn BrokerChannel>,
    }

    #[async_trait]
    impl BrokerChannel for SlowRegistration {
        async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            self.inner.exchange_declare(def).await
        }

        async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
            self.inner.queue_declare(def).await
        }

        async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
            self.inner.queue_bind(binding).await
        }

        async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
            tokio::task::yield_now().await;
            self.inner.basic_consume(queue, tag).await
        }

        async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError> {
            self.inner.basic_cancel(tag).await
        }

        async fn confirm_select(&self) -> Result<(), AmqpError> {
            self.inner.confirm_select().await
        }

        async fn basic_publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: &[u8],
            properties: BasicProperties,
        ) -> Result<ConfirmFuture, AmqpError> {
            self.inner
                .basic_publish(exchange, routing_key, payload, properties)
                .await
        }

        async fn close(&self) -> Result<(), AmqpError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn should_provision_consumer_topology() {
        let broker = InMemoryBroker::new();

        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Open);
        assert_eq!(consumer.tag(), "c1");

        let state = broker.topology();
        assert!(state.exchanges.contains_key(DEAD_LETTER_NAME));
        assert!(state.queues.contains_key(DEAD_LETTER_NAME));
        assert_eq!(
            state.exchanges.get("orders").map(|e| e.exchange_kind().clone()),
            Some(ExchangeKind::Topic)
        );

        let queue = state.queues.get("orders.new").unwrap();
        assert!(queue.is_durable());
        assert_eq!(
            queue
                .arguments()
                .inner()
                .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                .cloned(),
            Some(AMQPValue::LongString(DEAD_LETTER_NAME.into()))
        );
        assert!(state.bindings.contains(
            &QueueBinding::new("orders.new")
                .exchange("orders")
                .routing_key("*")
        ));
        assert!(state.bindings.contains(
            &QueueBinding::new(DEAD_LETTER_NAME)
                .exchange(DEAD_LETTER_NAME)
                .routing_key("*")
        ));
    }

    #[tokio::test]
    async fn should_provision_twice_with_identical_state() {
        let broker = InMemoryBroker::new();

        Consumer::new(&broker, orders_consumer()).await.unwrap();
        let first = broker.topology();
        Consumer::new(&broker, orders_consumer()).await.unwrap();

        assert_eq!(first, broker.topology());
    }

    #[tokio::test]
    async fn should_consume_deliveries() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();

        let mut deliveries = consumer.consume("orders.new").await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Active);

        broker.deliver("orders.new", b"hello");
        let delivery = deliveries.next().await.unwrap().unwrap();

        assert_eq!(delivery.data, b"hello".to_vec());
        assert_eq!(delivery.routing_key, "orders.new");
        assert!(!delivery.redelivered);
        assert_eq!(broker.consumers("orders.new"), vec!["c1".to_owned()]);
    }

    #[tokio::test]
    async fn should_surface_registration_failure() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();

        let res = consumer.consume("missing.queue").await;

        assert!(matches!(res, Err(AmqpError::ConsumerRegistrationError(tag)) if tag == "c1"));
        assert_eq!(consumer.state(), ConsumerState::Open);
    }

    #[tokio::test]
    async fn should_reject_second_registration_while_active() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();

        let _deliveries = consumer.consume("orders.new").await.unwrap();
        let res = consumer.consume("orders.new").await;

        assert_eq!(res.err(), Some(AmqpError::ConsumerAlreadyActive("c1".to_owned())));
    }

    #[tokio::test]
    async fn should_end_deliveries_and_close_channel_on_cancel() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();
        let mut deliveries = consumer.consume("orders.new").await.unwrap();

        consumer.cancel().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert!(deliveries.next().await.is_none());
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(broker.cancelled(), vec!["c1".to_owned()]);
        assert_eq!(broker.closed_channels(), 1);

        assert!(consumer.cancel().await.is_ok());
        assert_eq!(broker.closed_channels(), 1);
        assert_eq!(
            consumer.consume("orders.new").await.err(),
            Some(AmqpError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn should_fail_construction_naming_exchange_declare() {
        let broker = InMemoryBroker::new();
        broker.fail_on("exchange_declare:orders");

        let err = Consumer::new(&broker, orders_consumer()).await.unwrap_err();

        assert!(err.to_string().contains("Exchange Declare"));
        assert_eq!(broker.closed_channels(), 1);
    }

    #[tokio::test]
    async fn should_fail_construction_when_channel_cannot_be_opened() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel()
            .times(1)
            .returning(|| Err(AmqpError::ChannelError));

        let res = Consumer::new(&conn, orders_consumer()).await;

        assert_eq!(res.err(), Some(AmqpError::ChannelError));
    }

    #[tokio::test]
    async fn should_reject_empty_tag_without_opening_a_channel() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel().never();

        let def = ConsumerDefinition::new("orders", ExchangeKind::Topic, "orders.new", "");
        let res = Consumer::new(&conn, def).await;

        assert!(matches!(res, Err(AmqpError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn should_register_with_the_consumer_tag() {
        let mut channel = provisioned_channel();
        channel
            .expect_basic_consume()
            .withf(|queue, tag| queue == "orders.new" && tag == "c1")
            .times(1)
            .returning(|_, _| Ok(futures_util::stream::empty().boxed()));

        let consumer = consumer_on(Arc::new(channel)).await;
        let mut deliveries = consumer.consume("orders.new").await.unwrap();

        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn should_register_once_when_consume_calls_race() {
        let broker = InMemoryBroker::new();
        let inner = broker.open_channel().await.unwrap();
        let consumer = consumer_on(Arc::new(SlowRegistration { inner })).await;

        let (first, second) = tokio::join!(
            consumer.consume("orders.new"),
            consumer.consume("orders.new")
        );

        assert!(first.is_ok());
        assert_eq!(
            second.err(),
            Some(AmqpError::ConsumerAlreadyActive("c1".to_owned()))
        );
        let registrations = broker
            .calls()
            .iter()
            .filter(|call| call.as_str() == "basic_consume:orders.new:c1")
            .count();
        assert_eq!(registrations, 1);
        assert_eq!(consumer.state(), ConsumerState::Active);
    }

    #[tokio::test]
    async fn should_register_again_after_deliveries_end() {
        let mut channel = provisioned_channel();
        channel
            .expect_basic_consume()
            .times(2)
            .returning(|_, _| Ok(futures_util::stream::empty().boxed()));
        channel.expect_basic_cancel().never();

        let consumer = consumer_on(Arc::new(channel)).await;
        let mut deliveries = consumer.consume("orders.new").await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(consumer.state(), ConsumerState::Open);
        drop(deliveries);

        assert!(consumer.consume("orders.new").await.is_ok());
    }

    #[tokio::test]
    async fn should_cancel_dropped_subscription_before_registering_again() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();

        drop(consumer.consume("orders.new").await.unwrap());
        assert_eq!(consumer.state(), ConsumerState::Open);

        let mut deliveries = consumer.consume("orders.new").await.unwrap();
        broker.deliver("orders.new", b"hello");

        let calls = broker.calls();
        assert_eq!(
            calls[calls.len() - 3..],
            [
                "basic_consume:orders.new:c1",
                "basic_cancel:c1",
                "basic_consume:orders.new:c1",
            ]
        );
        assert_eq!(deliveries.next().await.unwrap().unwrap().data, b"hello".to_vec());
    }

    #[tokio::test]
    async fn should_ack_a_delivery_only_once() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();
        let mut deliveries = consumer.consume("orders.new").await.unwrap();
        broker.deliver("orders.new", b"hello");

        let delivery = deliveries.next().await.unwrap().unwrap();

        assert!(delivery.ack().await.is_ok());
        assert_eq!(delivery.ack().await, Err(AmqpError::AckMessageError));
        assert!(broker.calls().contains(&"basic_ack:1".to_owned()));
    }

    #[tokio::test]
    async fn should_dead_letter_rejected_delivery() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();
        let mut deliveries = consumer.consume("orders.new").await.unwrap();
        let publisher = Publisher::new(
            &broker,
            PublisherDefinition::new("orders", ExchangeKind::Topic, "orders.new", "new"),
        )
        .await
        .unwrap();
        publisher.publish(b"hello", false).await.unwrap();

        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        assert!(broker.calls().contains(&"basic_reject:1".to_owned()));
        assert_eq!(broker.queued(DEAD_LETTER_NAME), vec![b"hello".to_vec()]);
        assert!(broker.queued("orders.new").is_empty());
    }

    #[tokio::test]
    async fn should_redeliver_requeued_delivery() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::new(&broker, orders_consumer()).await.unwrap();
        let mut deliveries = consumer.consume("orders.new").await.unwrap();
        broker.deliver("orders.new", b"hello");

        let first = deliveries.next().await.unwrap().unwrap();
        first.requeue().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();

        assert!(!first.redelivered);
        assert!(second.redelivered);
        assert_eq!(second.data, b"hello".to_vec());
        assert!(broker.calls().contains(&"basic_nack:1".to_owned()));
        assert!(broker.queued(DEAD_LETTER_NAME).is_empty());
    }
}
