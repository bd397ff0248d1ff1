// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! This module turns application events into durable broker publications. Each
//! event is wrapped in an [`EventEnvelope`], serialized once and then published
//! to the `image_processing` exchange with the topic as routing key, retrying a
//! bounded number of times under a single overall deadline.

use crate::{
    errors::AmqpError,
    events::{
        DataSavedEventData, EventEnvelope, FaceRecognitionEventData, ImageReceivedEventData,
        TOPIC_DATA_SAVED, TOPIC_FACE_RECOGNITION, TOPIC_IMAGE_RECEIVED,
    },
    exchange::{EXCHANGE_KIND, EXCHANGE_NAME},
    link::BrokerLink,
    otel,
};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Retry and timeout policy of an [`EventPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Total number of publish attempts, at least one.
    pub max_retries: u32,
    /// Pause between two attempts.
    pub retry_delay: Duration,
    /// Overall budget of a single `publish` call, retries included.
    pub publish_timeout: Duration,
}

/// Publishes events through a shared [`BrokerLink`].
pub struct EventPublisher {
    link: Arc<BrokerLink>,
    settings: PublisherSettings,
}

impl EventPublisher {
    /// Creates a publisher on `link` without touching the broker.
    pub fn new(link: Arc<BrokerLink>, settings: PublisherSettings) -> Arc<EventPublisher> {
        Arc::new(EventPublisher { link, settings })
    }

    /// Declares the event exchange and creates the publisher.
    ///
    /// # Parameters
    /// * `link` - The shared broker link, already connected
    /// * `settings` - Retry and timeout policy
    ///
    /// # Returns
    /// An Arc-wrapped EventPublisher, or the declaration error
    pub async fn init(
        link: Arc<BrokerLink>,
        settings: PublisherSettings,
    ) -> Result<Arc<EventPublisher>, AmqpError> {
        link.declare_exchange(EXCHANGE_NAME, EXCHANGE_KIND).await?;
        info!(exchange = EXCHANGE_NAME, "rabbitmq publisher initialized");

        Ok(Self::new(link, settings))
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Publishes `data` under `topic`, bounded by the configured timeout.
    pub async fn publish<T>(&self, topic: &str, data: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_deadline(topic, data, None).await
    }

    /// Publishes `data` under `topic`.
    ///
    /// The overall deadline is the configured publish timeout, or `deadline`
    /// when that is earlier. Serialization failures are returned immediately;
    /// broker failures are retried up to `max_retries` attempts in total, with
    /// `retry_delay` between attempts, until the deadline.
    pub async fn publish_with_deadline<T>(
        &self,
        topic: &str,
        data: &T,
        deadline: Option<Instant>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let envelope = EventEnvelope::new(topic, data);

        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), topic, "failed to marshal event");
                return Err(AmqpError::SerializationError(err.to_string()));
            }
        };

        let own_deadline = Instant::now() + self.settings.publish_timeout;
        let deadline = match deadline {
            Some(caller) if caller < own_deadline => caller,
            _ => own_deadline,
        };

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(envelope.event_id.clone()))
            .with_type(ShortString::from(topic))
            .with_timestamp(envelope.timestamp.timestamp().max(0) as u64)
            .with_headers(otel::inject(&Context::current()));

        let max = self.settings.max_retries.max(1);
        let mut attempts = 0;
        let mut last_err = AmqpError::PublishTimeout;

        for attempt in 1..=max {
            if Instant::now() >= deadline {
                break;
            }
            attempts = attempt;

            match self
                .link
                .publish_with_properties(
                    deadline,
                    EXCHANGE_NAME,
                    topic,
                    &payload,
                    properties.clone(),
                )
                .await
            {
                Ok(()) => {
                    debug!(
                        topic,
                        event_id = %envelope.event_id,
                        attempt,
                        "event published successfully"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        topic, attempt, max, "failed to publish message"
                    );
                    last_err = err;
                }
            }

            if attempt < max {
                sleep_until((Instant::now() + self.settings.retry_delay).min(deadline)).await;
            }
        }

        error!(
            error = last_err.to_string(),
            topic, attempts, "giving up publishing event"
        );
        Err(AmqpError::PublishExhaustedError {
            attempts,
            last: Box::new(last_err),
        })
    }

    pub async fn publish_image_received(
        &self,
        data: &ImageReceivedEventData,
    ) -> Result<(), AmqpError> {
        self.publish(TOPIC_IMAGE_RECEIVED, data).await
    }

    pub async fn publish_face_recognition(
        &self,
        data: &FaceRecognitionEventData,
    ) -> Result<(), AmqpError> {
        self.publish(TOPIC_FACE_RECOGNITION, data).await
    }

    pub async fn publish_data_saved(&self, data: &DataSavedEventData) -> Result<(), AmqpError> {
        self.publish(TOPIC_DATA_SAVED, data).await
    }
}
