// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Bootstrap
//!
//! Wires the broker layer together at startup: one [`BrokerLink`], its
//! [`ReconnectSupervisor`], an [`EventPublisher`] and an [`EventConsumer`]
//! sharing that link.

use crate::{
    channel::LapinTransport,
    dispatcher::EventConsumer,
    errors::AmqpError,
    link::BrokerLink,
    publisher::EventPublisher,
    settings::{RabbitMqSettings, Settings},
    supervisor::ReconnectSupervisor,
    transport::Transport,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Connection name reported to the broker.
pub const CONNECTION_NAME: &str = "image-processing";

/// The process-wide broker layer.
pub struct Messaging {
    pub link: Arc<BrokerLink>,
    pub publisher: Arc<EventPublisher>,
    pub consumer: EventConsumer,
    supervisor: JoinHandle<()>,
}

impl Messaging {
    /// Connects to the broker configured in `settings` and starts supervising
    /// the connection.
    pub async fn start(settings: &Settings) -> Result<Messaging, AmqpError> {
        Self::start_with(LapinTransport::new(CONNECTION_NAME), &settings.rabbitmq).await
    }

    /// Same as [`Messaging::start`] over an arbitrary transport.
    pub async fn start_with(
        transport: Arc<dyn Transport>,
        cfg: &RabbitMqSettings,
    ) -> Result<Messaging, AmqpError> {
        let link = BrokerLink::new(transport, cfg.into());
        link.connect().await?;

        let supervisor = ReconnectSupervisor::spawn(link.clone()).await?;

        let publisher = match EventPublisher::init(link.clone(), cfg.into()).await {
            Ok(publisher) => publisher,
            Err(err) => {
                error!(error = err.to_string(), "failed to initialize publisher");
                if let Err(close_err) = link.close().await {
                    error!(error = close_err.to_string(), "failed to close link");
                }
                return Err(err);
            }
        };

        let consumer = EventConsumer::new(link.clone());

        info!(
            prefetch_count = cfg.prefetch_count,
            max_retries = cfg.max_retries,
            "messaging started"
        );

        Ok(Messaging {
            link,
            publisher,
            consumer,
            supervisor,
        })
    }

    /// Stops consumption, closes the link and waits for the supervisor to end.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        let result = self.consumer.stop().await;

        if let Err(err) = self.supervisor.await {
            error!(error = err.to_string(), "reconnect supervisor ended abnormally");
        }

        info!("messaging stopped");
        result
    }
}
