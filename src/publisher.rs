// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! A [`Publisher`] owns one channel, provisions its exchange, queue and binding
//! on construction and sends messages to its exchange with a fixed routing key.
//!
//! Sends are either fire-and-forget or confirmed. A confirmed send puts the
//! channel in confirm mode (once) and waits for the broker's ack or nack of
//! that very publish. Each publish owns its pending confirmation, so several
//! confirmed publishes may be in flight on the same publisher.

use crate::{
    channel::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::{DeadLetterDefinition, Topology, TopologyProvisioner},
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::OnceCell, time::timeout};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type of every published message
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// AMQP delivery mode 2, the broker persists the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
pub const DEFAULT_PRIORITY: u8 = 0;
/// Upper bound of the wait for a publish confirmation
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a publish as reported by the broker.
///
/// The delivery tag is the publish sequence number the broker assigned on the
/// channel once confirm mode was enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64 },
    /// The publish was not confirmed (fire-and-forget).
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack { .. })
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Confirmation::Nack { .. })
    }
}

/// Which queue the publisher declares next to its exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeclaredQueue {
    /// A queue named after the exchange; the target queue is only bound and
    /// must already exist on the broker.
    #[default]
    ExchangeNamed,
    /// The target queue itself.
    Target,
}

/// Everything a publisher needs to provision its topology and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherDefinition {
    pub(crate) exchange: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) queue: String,
    pub(crate) routing_key: String,
    pub(crate) declared_queue: DeclaredQueue,
    pub(crate) dead_letter: Option<DeadLetterDefinition>,
    pub(crate) fail_on_nack: bool,
    pub(crate) confirm_timeout: Option<Duration>,
}

impl PublisherDefinition {
    /// By default the queue named after the exchange is declared without a
    /// dead-letter target, `queue` is bound with `routing_key`, a nack is
    /// reported as [`Confirmation::Nack`] and confirmations are awaited for
    /// at most [`DEFAULT_CONFIRM_TIMEOUT`].
    pub fn new(
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        routing_key: &str,
    ) -> PublisherDefinition {
        PublisherDefinition {
            exchange: exchange.to_owned(),
            kind,
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            declared_queue: DeclaredQueue::default(),
            dead_letter: None,
            fail_on_nack: false,
            confirm_timeout: Some(DEFAULT_CONFIRM_TIMEOUT),
        }
    }

    /// Declares the target queue instead of the exchange-named one.
    pub fn declare_target_queue(mut self) -> Self {
        self.declared_queue = DeclaredQueue::Target;
        self
    }

    /// Installs the dead-letter path and wires the declared queue to it.
    pub fn with_dead_letter(mut self, def: DeadLetterDefinition) -> Self {
        self.dead_letter = Some(def);
        self
    }

    /// Reports a broker nack as [`AmqpError::PublishNacked`].
    pub fn fail_on_nack(mut self) -> Self {
        self.fail_on_nack = true;
        self
    }

    /// `None` waits for confirmations without bound.
    pub fn confirm_timeout(mut self, wait: Option<Duration>) -> Self {
        self.confirm_timeout = wait;
        self
    }

    pub(crate) fn topology(&self, channel: Arc<dyn BrokerChannel>) -> TopologyProvisioner {
        let declared = match self.declared_queue {
            DeclaredQueue::ExchangeNamed => &self.exchange,
            DeclaredQueue::Target => &self.queue,
        };

        let mut queue = QueueDefinition::new(declared).durable();
        let mut topology = TopologyProvisioner::new(channel);

        if let Some(dead_letter) = &self.dead_letter {
            queue = queue.dead_letter(dead_letter.name());
            topology = topology.dead_letter(dead_letter.clone());
        }

        topology
            .exchange(
                ExchangeDefinition::new(&self.exchange)
                    .kind(self.kind.clone())
                    .durable(),
            )
            .queue(queue)
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(&self.routing_key),
            )
    }
}

pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    routing_key: String,
    fail_on_nack: bool,
    confirm_timeout: Option<Duration>,
    confirm_mode: OnceCell<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("confirm_mode", &self.confirm_mode.initialized())
            .finish()
    }
}

impl Publisher {
    /// Opens a channel and provisions the publisher topology on it.
    ///
    /// Any failing declare or bind aborts construction; the channel is closed
    /// and entities declared so far stay on the broker.
    pub async fn new(
        conn: &dyn BrokerConnection,
        def: PublisherDefinition,
    ) -> Result<Publisher, AmqpError> {
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

        Ok(Publisher {
            channel,
            exchange: def.exchange,
            routing_key: def.routing_key,
            fail_on_nack: def.fail_on_nack,
            confirm_timeout: def.confirm_timeout,
            confirm_mode: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Sends `body` to the publisher's exchange with its routing key.
    ///
    /// With `reliable` the call waits for the broker's confirmation of this
    /// publish. A nack is returned as [`Confirmation::Nack`] unless the
    /// definition asked to fail on nack.
    pub async fn publish(&self, body: &[u8], reliable: bool) -> Result<Confirmation, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelClosed);
        }

        if reliable {
            self.enable_confirm_mode().await?;
        }

        let pending = self
            .channel
            .basic_publish(&self.exchange, &self.routing_key, body, self.properties())
            .await?;

        if !reliable {
            return Ok(Confirmation::NotRequested);
        }

        debug!("waiting for confirmation of one publishing");

        let confirmation = match self.confirm_timeout {
            Some(wait) => timeout(wait, pending).await.map_err(|_| {
                error!(timeout = ?wait, "no confirmation received in time");
                AmqpError::ConfirmTimeout
            })??,
            None => pending.await?,
        };

        match confirmation {
            Confirmation::Ack { delivery_tag } => {
                debug!("confirmed delivery with delivery tag: {}", delivery_tag);
                Ok(confirmation)
            }
            Confirmation::Nack { delivery_tag } => {
                warn!("failed delivery of delivery tag: {}", delivery_tag);
                if self.fail_on_nack {
                    return Err(AmqpError::PublishNacked(delivery_tag));
                }
                Ok(confirmation)
            }
            Confirmation::NotRequested => {
                warn!("broker did not confirm a publish in confirm mode");
                Ok(confirmation)
            }
        }
    }

    /// Closes the publisher channel. Later publishes fail with
    /// [`AmqpError::ChannelClosed`].
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.channel.close().await
    }

    async fn enable_confirm_mode(&self) -> Result<(), AmqpError> {
        self.confirm_mode
            .get_or_try_init(|| async {
                debug!("enabling publisher confirms");
                self.channel.confirm_select().await
            })
            .await
            .map(|_| ())
    }

    fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_priority(DEFAULT_PRIORITY)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(otel::inject_context(&Context::current())))
    }
}
