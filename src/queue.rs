// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declarations and queue-to-exchange bindings. Queues declared by the
//! consumer are durable, non-exclusive and never auto-deleted, so declaring
//! an existing queue again is a no-op on the broker.

use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Creates a durable, shared, persistent queue definition.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            ttl: None,
            max_length: None,
        }
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds the `x-*` declaration arguments for the broker.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_ARGS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_ARGS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        FieldTable::from(args)
    }
}

/// Queue as reported by the broker after a declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue with an empty exchange and key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_match_broker_contract() {
        let def = QueueDefinition::new("faces");
        assert!(def.durable);
        assert!(!def.exclusive);
        assert!(!def.auto_delete);
        assert!(def.arguments().inner().is_empty());
    }

    #[test]
    fn queue_arguments_carry_limits() {
        let args = QueueDefinition::new("faces")
            .ttl(60_000)
            .max_length(500)
            .arguments();

        assert_eq!(
            args.inner().get(AMQP_ARGS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            args.inner().get(AMQP_ARGS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(500))
        );
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("faces")
            .exchange("image_processing")
            .routing_key("image.received");
        assert_eq!(binding.queue_name, "faces");
        assert_eq!(binding.exchange_name, "image_processing");
        assert_eq!(binding.routing_key, "image.received");
    }
}
