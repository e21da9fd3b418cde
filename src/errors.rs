// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topology and Delivery Layer
//!
//! The `AmqpError` enum represents every failure surfaced by channel handling,
//! topology provisioning, consuming and publishing. Provisioning variants carry
//! the name of the failing step in their message (`Exchange Declare`,
//! `Queue Declare`, `Queue Bind`) so callers can tell where construction stopped.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error opening a channel on an established connection
    #[error("Channel: failure to create a channel")]
    ChannelError,

    /// The channel owned by a consumer or publisher was already closed
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("Exchange Declare: failure to declare the exchange `{0}` - {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("Queue Declare: failure to declare the queue `{0}` - {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("Queue Bind: failure to bind exchange `{0}` to queue `{1}` - {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to register consumer `{0}`")]
    ConsumerRegistrationError(String),

    /// The consumer tag already has a live subscription on this channel
    #[error("consumer `{0}` is already consuming")]
    ConsumerAlreadyActive(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error putting the channel into confirm mode
    #[error("channel could not be put into confirm mode")]
    ConfirmModeError,

    /// Error publishing a message
    #[error("Exchange Publish: failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged the publish with the given sequence number
    #[error("broker nacked the publish `{0}`")]
    PublishNacked(u64),

    /// No confirmation arrived within the publisher's confirm timeout
    #[error("timed out waiting for the publish confirmation")]
    ConfirmTimeout,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error receiving a message from an active subscription
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A definition failed validation before touching the broker
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_name_the_failing_provisioning_step() {
        let err = AmqpError::DeclareExchangeError("orders".to_owned(), "unreachable".to_owned());
        assert!(err.to_string().starts_with("Exchange Declare"));

        let err = AmqpError::DeclareQueueError("orders.new".to_owned(), "unreachable".to_owned());
        assert!(err.to_string().starts_with("Queue Declare"));

        let err = AmqpError::BindingExchangeToQueueError(
            "orders".to_owned(),
            "orders.new".to_owned(),
            "unreachable".to_owned(),
        );
        assert_eq!(
            err.to_string(),
            "Queue Bind: failure to bind exchange `orders` to queue `orders.new` - unreachable"
        );
    }
}
