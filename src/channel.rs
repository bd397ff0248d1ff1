// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels
//! through `lapin`. It provides the concrete [`Transport`] used in production and the
//! [`AmqpSession`] wrapping one live connection/channel pair.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, AmqpSession, CloseNotifier, DeliveryStream, InboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Production transport backed by `lapin`.
pub struct LapinTransport {
    connection_name: String,
}

impl LapinTransport {
    /// Creates a new transport whose connections advertise `connection_name`
    /// to the broker.
    pub fn new(connection_name: &str) -> Arc<LapinTransport> {
        Arc::new(LapinTransport {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    /// Opens a connection, a channel with the requested prefetch count and
    /// publisher confirms enabled, and registers for connection errors.
    ///
    /// # Parameters
    /// * `url` - AMQP URI of the broker
    /// * `prefetch_count` - Maximum number of unacknowledged deliveries
    /// * `notifier` - Receives a notice when the connection drops
    ///
    /// # Returns
    /// The new session, or an error with nothing left open on failure
    async fn open(
        &self,
        url: &str,
        prefetch_count: u16,
        notifier: CloseNotifier,
    ) -> Result<Arc<dyn AmqpSession>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                discard(&conn, None).await;
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };

        if let Err(err) = channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "error to configure qos");
            discard(&conn, Some(&channel)).await;
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            discard(&conn, Some(&channel)).await;
            return Err(AmqpError::ChannelError(err.to_string()));
        }

        let generation = notifier.generation();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), generation, "amqp connection closed");
            notifier.notify(err.to_string());
        });
        debug!(generation, "channel created");

        Ok(Arc::new(LapinSession {
            connection: conn,
            channel,
        }))
    }
}

async fn discard(conn: &Connection, channel: Option<&Channel>) {
    if let Some(channel) = channel {
        if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = err.to_string(), "error closing partial channel");
        }
    }

    if let Err(err) = conn.close(REPLY_SUCCESS, "OK").await {
        debug!(error = err.to_string(), "error closing partial connection");
    }
}

/// A live `lapin` connection with its channel.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl AmqpSession for LapinSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(DeclaredQueue {
                name: queue.name().as_str().to_owned(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                error!("broker rejected published message");
                Err(AmqpError::PublishingError("message nacked by broker".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(inbound(delivery)),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(Box::pin(stream))
    }

    async fn close_channel(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn close_connection(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

fn inbound(delivery: Delivery) -> InboundMessage {
    let Delivery {
        delivery_tag,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    InboundMessage::new(
        data,
        properties.headers().clone(),
        redelivered,
        delivery_tag,
        Box::new(LapinAcker(acker)),
    )
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.0.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}
