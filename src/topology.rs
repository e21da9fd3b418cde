// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Provisioning
//!
//! This module declares exchanges, queues and the bindings between them before
//! any traffic flows. Consumers and publishers share the same provisioner so
//! topology setup is consistent across both roles.
//!
//! Install order is fixed:
//! 1. the dead-letter path (exchange, queue, binding), when configured
//! 2. exchanges
//! 3. queues
//! 4. queue-to-exchange bindings
//!
//! Every declare is idempotent, so a failed install can be re-run. Nothing is
//! rolled back on failure; entities declared before the failing step remain on
//! the broker.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Well-known name of both the dead-letter exchange and the dead-letter queue
pub const DEAD_LETTER_NAME: &str = "dead_letter";
/// Pattern binding the dead-letter queue to the dead-letter exchange
pub const DEAD_LETTER_BINDING_KEY: &str = "*";
/// Pattern used when a queue should receive every single-word routing key
pub const WILDCARD_BINDING_KEY: &str = "*";

/// The exchange and queue pair every application queue overflows into.
///
/// Both share one name; defaults to a durable `dead_letter` topic exchange
/// whose queue is bound with `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) binding_key: String,
}

impl Default for DeadLetterDefinition {
    fn default() -> Self {
        DeadLetterDefinition {
            name: DEAD_LETTER_NAME.to_owned(),
            kind: ExchangeKind::Topic,
            binding_key: DEAD_LETTER_BINDING_KEY.to_owned(),
        }
    }
}

impl DeadLetterDefinition {
    pub fn new(name: &str) -> DeadLetterDefinition {
        DeadLetterDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_key = key.to_owned();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.name)
            .kind(self.kind.clone())
            .durable()
    }

    pub(crate) fn queue(&self) -> QueueDefinition {
        QueueDefinition::new(&self.name).durable()
    }

    pub(crate) fn binding(&self) -> QueueBinding {
        QueueBinding::new(&self.name)
            .exchange(&self.name)
            .routing_key(&self.binding_key)
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Installs the dead-letter path before anything else.
    fn dead_letter(self, def: DeadLetterDefinition) -> Self;

    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything registered, in install order.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Provisions a [`Topology`] through a broker channel.
pub struct TopologyProvisioner {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) dead_letter: Option<DeadLetterDefinition>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl TopologyProvisioner {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> TopologyProvisioner {
        TopologyProvisioner {
            channel,
            dead_letter: None,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl Topology for TopologyProvisioner {
    fn dead_letter(mut self, def: DeadLetterDefinition) -> Self {
        self.dead_letter = Some(def);
        self
    }

    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.validate()?;
        self.install_dead_letter().await?;
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl TopologyProvisioner {
    fn validate(&self) -> Result<(), AmqpError> {
        if let Some(dead_letter) = &self.dead_letter {
            dead_letter.exchange().validate()?;
        }

        for exch in &self.exchanges {
            exch.validate()?;
        }

        for queue in &self.queues {
            queue.validate()?;
        }

        for binding in &self.queues_binding {
            if binding.queue_name.is_empty() || binding.exchange_name.is_empty() {
                return Err(AmqpError::InvalidDefinition(format!(
                    "binding `{}` -> `{}` needs both a queue and an exchange",
                    binding.exchange_name, binding.queue_name
                )));
            }
        }

        Ok(())
    }

    async fn install_dead_letter(&self) -> Result<(), AmqpError> {
        let Some(dead_letter) = &self.dead_letter else {
            return Ok(());
        };

        debug!("installing dead letter path: {}", dead_letter.name);

        self.declare_exchange(&dead_letter.exchange()).await?;
        self.declare_queue(&dead_letter.queue()).await?;
        self.bind_queue(&dead_letter.binding()).await
    }

    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for queue in &self.queues {
            self.declare_queue(queue).await?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }

    async fn declare_exchange(&self, exch: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        match self.channel.exchange_declare(exch).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => {
                debug!("exchange: {} was created", exch.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", queue.name);

        match self.channel.queue_declare(queue).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = queue.name.as_str(),
                    "error to declare the queue"
                );
                Err(err)
            }
            _ => {
                debug!("queue: {} was created", queue.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel.queue_bind(binding).await.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerConnection, MockBrokerChannel},
        mocks::InMemoryBroker,
    };
    use mockall::Sequence;

    fn application_topology(channel: Arc<dyn BrokerChannel>) -> TopologyProvisioner {
        TopologyProvisioner::new(channel)
            .dead_letter(DeadLetterDefinition::default())
            .exchange(ExchangeDefinition::new("orders").topic().durable())
            .queue(
                QueueDefinition::new("orders.new")
                    .durable()
                    .dead_letter(DEAD_LETTER_NAME),
            )
            .queue_binding(
                QueueBinding::new("orders.new")
                    .exchange("orders")
                    .routing_key(WILDCARD_BINDING_KEY),
            )
    }

    #[tokio::test]
    async fn should_install_dead_letter_path_before_application_topology() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        application_topology(channel).install().await.unwrap();

        assert_eq!(
            broker.calls(),
            vec![
                "open_channel",
                "exchange_declare:dead_letter",
                "queue_declare:dead_letter",
                "queue_bind:dead_letter:dead_letter:*",
                "exchange_declare:orders",
                "queue_declare:orders.new",
                "queue_bind:orders:orders.new:*",
            ]
        );
    }

    #[tokio::test]
    async fn should_be_idempotent() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        application_topology(channel.clone()).install().await.unwrap();
        let first = broker.topology();

        application_topology(channel).install().await.unwrap();
        let second = broker.topology();

        assert_eq!(first, second);
        assert_eq!(second.exchanges.len(), 2);
        assert_eq!(second.queues.len(), 2);
        assert_eq!(second.bindings.len(), 2);
    }

    #[tokio::test]
    async fn should_fail_on_mismatched_redeclare() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        TopologyProvisioner::new(channel.clone())
            .exchange(ExchangeDefinition::new("orders").topic().durable())
            .install()
            .await
            .unwrap();

        let res = TopologyProvisioner::new(channel)
            .exchange(ExchangeDefinition::new("orders").fanout().durable())
            .install()
            .await;

        assert!(matches!(res, Err(AmqpError::DeclareExchangeError(name, _)) if name == "orders"));
    }

    #[tokio::test]
    async fn should_stop_at_the_first_failing_step_without_rollback() {
        let broker = InMemoryBroker::new();
        broker.fail_on("queue_declare:orders.new");
        let channel = broker.open_channel().await.unwrap();

        let res = application_topology(channel).install().await;

        let err = res.unwrap_err();
        assert!(err.to_string().starts_with("Queue Declare"));

        let state = broker.topology();
        assert!(state.exchanges.contains_key("orders"));
        assert!(state.queues.contains_key(DEAD_LETTER_NAME));
        assert!(!state.queues.contains_key("orders.new"));
        assert!(state.bindings.iter().all(|b| b.queue_name() != "orders.new"));
    }

    #[tokio::test]
    async fn should_surface_dead_letter_binding_failure() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|b| {
                Err(AmqpError::BindingExchangeToQueueError(
                    b.exchange_name().to_owned(),
                    b.queue_name().to_owned(),
                    "NOT_FOUND".to_owned(),
                ))
            });

        let res = application_topology(Arc::new(channel)).install().await;

        assert!(matches!(res, Err(AmqpError::BindingExchangeToQueueError(..))));
    }

    #[tokio::test]
    async fn should_reject_invalid_definitions_before_touching_the_broker() {
        let channel = MockBrokerChannel::new();

        let res = TopologyProvisioner::new(Arc::new(channel))
            .exchange(ExchangeDefinition::new(""))
            .install()
            .await;

        assert!(matches!(res, Err(AmqpError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn should_use_configured_dead_letter_names() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        TopologyProvisioner::new(channel)
            .dead_letter(
                DeadLetterDefinition::new("orders.dlx")
                    .kind(ExchangeKind::Direct)
                    .binding_key("failed"),
            )
            .install()
            .await
            .unwrap();

        let state = broker.topology();
        assert_eq!(
            state.exchanges.get("orders.dlx").map(|e| e.exchange_kind().clone()),
            Some(ExchangeKind::Direct)
        );
        assert!(state.bindings.contains(
            &QueueBinding::new("orders.dlx")
                .exchange("orders.dlx")
                .routing_key("failed")
        ));
    }
}
