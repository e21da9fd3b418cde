// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A [`BrokerConnection`] that keeps exchanges, queues and bindings in memory
//! with the broker's declare semantics: redeclaring with the same attributes is
//! a no-op, mismatching attributes fail, and binding needs both ends to exist.
//! Published messages are routed to bound queues and handed to registered
//! consumers. Confirmations are acks unless scripted otherwise. Rejected
//! deliveries follow their queue's dead-letter exchange, requeued ones come
//! back redelivered.

use crate::{
    channel::{BrokerChannel, BrokerConnection, ConfirmFuture, DeliveryStream},
    consumer::{Delivery, Settlement},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    publisher::Confirmation,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future, stream, FutureExt, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Declared entities, comparable across installs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerTopology {
    pub exchanges: BTreeMap<String, ExchangeDefinition>,
    pub queues: BTreeMap<String, QueueDefinition>,
    pub bindings: BTreeSet<QueueBinding>,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmReply {
    Ack,
    Nack,
    Never,
}

struct Subscriber {
    channel_id: u64,
    tag: String,
    sender: UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    topology: BrokerTopology,
    backlog: BTreeMap<String, VecDeque<Message>>,
    subscribers: BTreeMap<String, Vec<Subscriber>>,
    published: Vec<PublishedMessage>,
    calls: Vec<String>,
    fail_on: BTreeSet<String>,
    replies: VecDeque<ConfirmReply>,
    withhold_confirms: bool,
    confirm_selects: usize,
    confirmations_consumed: usize,
    opened_channels: u64,
    closed_channels: usize,
    cancelled: Vec<String>,
    delivery_tag: u64,
}

impl BrokerState {
    fn record(&mut self, call: String) -> Result<(), String> {
        let failing = self.fail_on.contains(&call);
        self.calls.push(call);

        if failing {
            return Err("broker unreachable".to_owned());
        }

        Ok(())
    }

    fn dispatch(&mut self, shared: &Arc<Mutex<BrokerState>>, queue: &str, message: Message) {
        let subscriber = self
            .subscribers
            .get(queue)
            .and_then(|subs| subs.iter().find(|s| !s.sender.is_closed()));

        match subscriber {
            Some(subscriber) => {
                self.delivery_tag += 1;
                let delivery = Delivery::in_memory(
                    self.delivery_tag,
                    &message.exchange,
                    &message.routing_key,
                    message.redelivered,
                    message.properties.clone(),
                    &message.payload,
                    InMemorySettler {
                        state: shared.clone(),
                        queue: queue.to_owned(),
                        delivery_tag: self.delivery_tag,
                        message: message.clone(),
                        used: AtomicBool::new(false),
                    },
                );
                let _ = subscriber.sender.send(delivery);
            }
            None => self
                .backlog
                .entry(queue.to_owned())
                .or_default()
                .push_back(message),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        let Some(exch) = self.topology.exchanges.get(exchange) else {
            return BTreeSet::new();
        };

        self.topology
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match exch.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                _ => b.routing_key == routing_key,
            })
            .map(|b| b.queue_name.clone())
            .collect()
    }
}

/// Settles one in-memory delivery against the broker state.
pub(crate) struct InMemorySettler {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
    message: Message,
    used: AtomicBool,
}

impl InMemorySettler {
    pub(crate) fn settle(&self, outcome: Settlement) -> Result<(), String> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err("PRECONDITION_FAILED - delivery already settled".to_owned());
        }

        let mut state = lock(&self.state);
        let method = match outcome {
            Settlement::Ack => "basic_ack",
            Settlement::Reject => "basic_reject",
            Settlement::Requeue => "basic_nack",
        };
        state.record(format!("{}:{}", method, self.delivery_tag))?;

        match outcome {
            Settlement::Ack => {}
            Settlement::Requeue => {
                let message = Message {
                    redelivered: true,
                    ..self.message.clone()
                };
                state.dispatch(&self.state, &self.queue, message);
            }
            Settlement::Reject => {
                let dead_letter = state
                    .topology
                    .queues
                    .get(&self.queue)
                    .and_then(|q| q.dead_letter_exchange.clone());

                if let Some(exchange) = dead_letter {
                    for queue in state.route(&exchange, &self.message.routing_key) {
                        let message = Message {
                            exchange: exchange.clone(),
                            redelivered: false,
                            ..self.message.clone()
                        };
                        state.dispatch(&self.state, &queue, message);
                    }
                }
            }
        }

        Ok(())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn same_exchange(a: &ExchangeDefinition, b: &ExchangeDefinition) -> bool {
    a.kind == b.kind
        && a.durable == b.durable
        && a.delete == b.delete
        && a.internal == b.internal
        && a.params == b.params
}

fn same_queue(a: &QueueDefinition, b: &QueueDefinition) -> bool {
    a.durable == b.durable
        && a.delete == b.delete
        && a.exclusive == b.exclusive
        && a.dead_letter_exchange == b.dead_letter_exchange
        && a.ttl == b.ttl
        && a.max_length == b.max_length
        && a.max_length_bytes == b.max_length_bytes
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Fails the call recorded as `call`, e.g. `exchange_declare:orders`.
    pub fn fail_on(&self, call: &str) {
        self.state().fail_on.insert(call.to_owned());
    }

    /// Nacks the next confirmed publish.
    pub fn nack_next(&self) {
        self.state().replies.push_back(ConfirmReply::Nack);
    }

    /// Never confirms publishes from now on.
    pub fn withhold_confirms(&self) {
        self.state().withhold_confirms = true;
    }

    /// Puts a message straight into `queue`, as the default exchange would.
    pub fn deliver(&self, queue: &str, payload: &[u8]) {
        self.state().dispatch(
            &self.state,
            queue,
            Message {
                exchange: String::new(),
                routing_key: queue.to_owned(),
                payload: payload.to_vec(),
                properties: BasicProperties::default(),
                redelivered: false,
            },
        );
    }

    /// Payloads waiting in `queue` for a consumer.
    pub fn queued(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .backlog
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn topology(&self) -> BrokerTopology {
        self.state().topology.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn consumers(&self, queue: &str) -> Vec<String> {
        self.state()
            .subscribers
            .get(queue)
            .map(|subs| subs.iter().map(|s| s.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn confirm_selects(&self) -> usize {
        self.state().confirm_selects
    }

    pub fn confirmations_consumed(&self) -> usize {
        self.state().confirmations_consumed
    }

    pub fn opened_channels(&self) -> u64 {
        self.state().opened_channels
    }

    pub fn closed_channels(&self) -> usize {
        self.state().closed_channels
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state();
        state
            .record("open_channel".to_owned())
            .map_err(|_| AmqpError::ChannelError)?;
        state.opened_channels += 1;

        Ok(Arc::new(InMemoryChannel {
            id: state.opened_channels,
            state: self.state.clone(),
            confirm_mode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        }))
    }
}

struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    confirm_mode: AtomicBool,
    closed: AtomicBool,
    sequence: AtomicU64,
}

impl InMemoryChannel {
    fn check_open(&self) -> Result<(), String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err("channel closed".to_owned());
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        let err = |reason: String| AmqpError::DeclareExchangeError(def.name.clone(), reason);

        self.check_open().map_err(err)?;
        state
            .record(format!("exchange_declare:{}", def.name))
            .map_err(err)?;

        let existing = state.topology.exchanges.get(&def.name).cloned();
        match existing {
            Some(existing) if !def.passive && !same_exchange(&existing, def) => {
                Err(err("PRECONDITION_FAILED - inequivalent arg".to_owned()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(err("NOT_FOUND - no exchange".to_owned())),
            None => {
                state
                    .topology
                    .exchanges
                    .insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        let err = |reason: String| AmqpError::DeclareQueueError(def.name.clone(), reason);

        self.check_open().map_err(err)?;
        state
            .record(format!("queue_declare:{}", def.name))
            .map_err(err)?;

        let existing = state.topology.queues.get(&def.name).cloned();
        match existing {
            Some(existing) if !def.passive && !same_queue(&existing, def) => {
                Err(err("PRECONDITION_FAILED - inequivalent arg".to_owned()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(err("NOT_FOUND - no queue".to_owned())),
            None => {
                state.topology.queues.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        let err = |reason: String| {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
                reason,
            )
        };

        self.check_open().map_err(err)?;
        state
            .record(format!(
                "queue_bind:{}:{}:{}",
                binding.exchange_name, binding.queue_name, binding.routing_key
            ))
            .map_err(err)?;

        if !state.topology.exchanges.contains_key(&binding.exchange_name) {
            return Err(err("NOT_FOUND - no exchange".to_owned()));
        }

        if !state.topology.queues.contains_key(&binding.queue_name) {
            return Err(err("NOT_FOUND - no queue".to_owned()));
        }

        state.topology.bindings.insert(binding.clone());
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = lock(&self.state);
        let err = |_| AmqpError::ConsumerRegistrationError(tag.to_owned());

        self.check_open().map_err(err)?;
        state
            .record(format!("basic_consume:{}:{}", queue, tag))
            .map_err(err)?;

        if !state.topology.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerRegistrationError(tag.to_owned()));
        }

        // NOT_ALLOWED - attempt to reuse consumer tag
        let reused = state
            .subscribers
            .values()
            .flatten()
            .any(|s| s.channel_id == self.id && s.tag == tag);
        if reused {
            return Err(AmqpError::ConsumerRegistrationError(tag.to_owned()));
        }

        let (sender, receiver) = unbounded_channel();
        state
            .subscribers
            .entry(queue.to_owned())
            .or_default()
            .push(Subscriber {
                channel_id: self.id,
                tag: tag.to_owned(),
                sender,
            });

        let backlog = state.backlog.remove(queue).unwrap_or_default();
        for message in backlog {
            state.dispatch(&self.state, queue, message);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, tag: &str) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        self.check_open()
            .map_err(|_| AmqpError::CancelConsumerError(tag.to_owned()))?;
        state
            .record(format!("basic_cancel:{}", tag))
            .map_err(|_| AmqpError::CancelConsumerError(tag.to_owned()))?;

        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|s| !(s.channel_id == self.id && s.tag == tag));
        }
        state.cancelled.push(tag.to_owned());

        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        self.check_open().map_err(|_| AmqpError::ConfirmModeError)?;
        state
            .record("confirm_select".to_owned())
            .map_err(|_| AmqpError::ConfirmModeError)?;

        state.confirm_selects += 1;
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
        let mut state = lock(&self.state);

        self.check_open().map_err(|_| AmqpError::PublishingError)?;
        state
            .record(format!("basic_publish:{}:{}", exchange, routing_key))
            .map_err(|_| AmqpError::PublishingError)?;

        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });

        for queue in state.route(exchange, routing_key) {
            state.dispatch(
                &self.state,
                &queue,
                Message {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    payload: payload.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                },
            );
        }

        if !self.confirm_mode.load(Ordering::SeqCst) {
            return Ok(future::ready(Ok(Confirmation::NotRequested)).boxed());
        }

        let delivery_tag = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = if state.withhold_confirms {
            ConfirmReply::Never
        } else {
            state.replies.pop_front().unwrap_or(ConfirmReply::Ack)
        };

        let shared = self.state.clone();
        Ok(async move {
            let confirmation = match reply {
                ConfirmReply::Ack => Confirmation::Ack { delivery_tag },
                ConfirmReply::Nack => Confirmation::Nack { delivery_tag },
                ConfirmReply::Never => future::pending().await,
            };
            lock(&shared).confirmations_consumed += 1;
            Ok::<_, AmqpError>(confirmation)
        }
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        state
            .record("close".to_owned())
            .map_err(|_| AmqpError::ChannelError)?;

        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|s| s.channel_id != self.id);
        }
        state.closed_channels += 1;

        Ok(())
    }
}
