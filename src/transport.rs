// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The broker client library is used through two small traits: a [`Transport`]
//! that dials a fresh connection/channel pair, and an [`AmqpSession`] that
//! represents one such live pair. Everything above this module (the link, the
//! publisher and the dispatcher) only talks to these traits, which keeps the
//! reconnection and dispatch logic independent of the wire implementation.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Dials new broker sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection and a channel on it, applies the prefetch count and
    /// wires unexpected connection closure to `notifier`.
    ///
    /// On partial failure everything opened so far is closed again before the
    /// error is returned.
    async fn open(
        &self,
        url: &str,
        prefetch_count: u16,
        notifier: CloseNotifier,
    ) -> Result<Arc<dyn AmqpSession>, AmqpError>;
}

/// One live connection/channel pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpSession: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a single message and waits for the broker to confirm it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack, non-exclusive subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn close_channel(&self) -> Result<(), AmqpError>;

    async fn close_connection(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from the broker.
///
/// `ack` and `nack` take the message by value, so a delivery can only ever be
/// settled once.
pub struct InboundMessage {
    pub data: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        data: Vec<u8>,
        headers: Option<FieldTable>,
        redelivered: bool,
        delivery_tag: u64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        InboundMessage {
            data,
            headers,
            redelivered,
            delivery_tag,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Notice that the connection of a given generation was lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub generation: u64,
    pub reason: String,
}

/// Handle given to a [`Transport`] to report unexpected connection closure.
///
/// Every connection generation gets its own notifier, so notices raised by a
/// connection that has already been replaced can be told apart.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<CloseNotice>,
}

impl CloseNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<CloseNotice>) -> Self {
        CloseNotifier { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, reason: impl Into<String>) {
        let notice = CloseNotice {
            generation: self.generation,
            reason: reason.into(),
        };

        if self.tx.send(notice).is_err() {
            debug!(generation = self.generation, "close notice dropped, link is gone");
        }
    }
}
