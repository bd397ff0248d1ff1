// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient AMQP client layer: one shared, self-healing broker connection, a
//! publisher with bounded retries under a deadline, and a consumer that
//! dispatches every delivery concurrently with ack/nack settlement.

mod consumer;
mod otel;

pub mod bootstrap;
pub mod channel;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod link;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod settings;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use bootstrap::Messaging;
pub use consumer::Settlement;
pub use dispatcher::{EventConsumer, EventHandler, FnHandler};
pub use errors::{AmqpError, HandlerError};
pub use link::{BrokerLink, LinkSettings};
pub use publisher::{EventPublisher, PublisherSettings};
pub use settings::{load_config, Settings};
pub use supervisor::ReconnectSupervisor;
