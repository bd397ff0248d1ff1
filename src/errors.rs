// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Client Layer
//!
//! This module provides the error types for the connection, publish and consume
//! paths. `AmqpError` covers every failure that can happen while talking to the
//! broker, while `HandlerError` is what application handlers return when they
//! cannot process a delivered event.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level variants are absorbed by the reconnect supervisor and only
/// reach callers as `NotInitializedError`. Publish-level variants are surfaced
/// to the caller once retries are exhausted. Consume-level variants never leave
/// the dispatcher; they only decide how a delivery is settled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No live channel is available, typically while a reconnect is running
    #[error("channel is not initialized")]
    NotInitializedError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The publish deadline elapsed before the broker confirmed the message
    #[error("publish deadline exceeded")]
    PublishTimeout,

    /// Every publish attempt failed or the deadline elapsed first
    #[error("failure to publish after {attempts} attempts: {last}")]
    PublishExhaustedError { attempts: u32, last: Box<AmqpError> },

    /// Error encoding an event envelope
    #[error("failure to serialize event: {0}")]
    SerializationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error: {0}")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing the connection
    #[error("failure to close connection: {0}")]
    CloseError(String),

    /// A delivered body is not a JSON object
    #[error("failure to decode message: {0}")]
    DecodeError(String),

    /// A delivered envelope has no usable handler
    #[error("failure to route message: {0}")]
    RoutingError(String),
}

/// Failure reported by an event handler.
///
/// Handler failures are assumed to be transient, so the delivery that produced
/// one is requeued for redelivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}
