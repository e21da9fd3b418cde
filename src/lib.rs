// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Topology provisioning and delivery over RabbitMQ.
//!
//! A [`consumer::Consumer`] and a [`publisher::Publisher`] each own one channel
//! of a shared [`channel::BrokerConnection`] and provision their exchange,
//! queue, bindings and dead-letter path through a
//! [`topology::TopologyProvisioner`] before any traffic flows.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod publisher;
pub mod queue;
pub mod topology;
