// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Consumer
//!
//! This module subscribes queues to the event exchange and dispatches each
//! delivery to the handler registered for its `event_type`. Every delivery is
//! processed on its own task, so a slow handler never holds up the next
//! delivery; an optional semaphore bounds the number of handlers in flight.
//!
//! A dispatch loop outlives the connection it started on. When the delivery
//! stream ends because the connection was lost, the loop waits for the link to
//! reconnect and then declares, binds and subscribes again on the new channel.

use crate::{
    consumer::{process_message, Settlement},
    errors::{AmqpError, HandlerError},
    exchange::EXCHANGE_NAME,
    link::{self, BrokerLink},
    otel::CONSUMER_TRACER,
    transport::{DeliveryStream, InboundMessage},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    Context,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handles one kind of event.
///
/// `payload` is the raw body of the delivery, i.e. the whole JSON envelope.
/// Returning an error requeues the delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Adapts a plain closure to [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, _ctx: &Context, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(payload)
    }
}

/// Handlers keyed by event type.
pub(crate) type HandlerMap = HashMap<String, Arc<dyn EventHandler>>;

/// Consumes events from the broker through a shared [`BrokerLink`].
pub struct EventConsumer {
    link: Arc<BrokerLink>,
    handlers: Arc<RwLock<HandlerMap>>,
    limiter: Option<Arc<Semaphore>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(link: Arc<BrokerLink>) -> Self {
        EventConsumer {
            link,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            limiter: None,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Caps the number of handlers running at the same time. Deliveries past
    /// the cap wait for a free slot before they are spawned.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max.max(1))));
        self
    }

    /// Registers `handler` for `event_type`, replacing any previous one.
    pub fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_owned(), handler)
            .is_some();

        debug!(event_type, replaced, "handler registered");
    }

    /// Registers a closure for `event_type`, replacing any previous handler.
    pub fn register_fn<F>(&self, event_type: &str, f: F)
    where
        F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(event_type, Arc::new(FnHandler::new(f)));
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event_type)
    }

    /// Declares `queue`, binds it to the event exchange for every routing key
    /// and starts dispatching its deliveries in the background.
    ///
    /// Errors from the initial declaration and subscription are returned;
    /// once this succeeds, consumption keeps going across reconnects until
    /// [`EventConsumer::stop`] is called.
    pub async fn start_consuming(
        &self,
        queue: &str,
        routing_keys: &[&str],
    ) -> Result<(), AmqpError> {
        let subscription = Subscription {
            queue: queue.to_owned(),
            routing_keys: routing_keys.iter().map(|k| (*k).to_owned()).collect(),
            consumer_tag: format!("{queue}.{}", Uuid::new_v4()),
        };

        let generation = self.link.generation();
        let deliveries = subscription.open(&self.link).await?;

        info!(
            queue,
            routing_keys = ?routing_keys,
            "started consuming messages"
        );

        let dispatch = DispatchLoop {
            link: self.link.clone(),
            handlers: self.handlers.clone(),
            limiter: self.limiter.clone(),
            tracer: Arc::new(global::tracer(CONSUMER_TRACER)),
            subscription,
        };

        let handle = tokio::spawn(dispatch.run(deliveries, generation));
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        Ok(())
    }

    /// Stops every dispatch loop and closes the shared link.
    ///
    /// Handlers already running finish on their own; their settlement fails
    /// once the channel is gone and the broker redelivers those messages.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let loops: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in loops {
            handle.abort();
        }

        self.link.close().await
    }
}

struct Subscription {
    queue: String,
    routing_keys: Vec<String>,
    consumer_tag: String,
}

impl Subscription {
    async fn open(&self, link: &BrokerLink) -> Result<DeliveryStream, AmqpError> {
        link.declare_queue(&self.queue).await?;

        for key in &self.routing_keys {
            link.bind_queue(&self.queue, key, EXCHANGE_NAME).await?;
        }

        link.consume(&self.queue, &self.consumer_tag).await
    }
}

struct DispatchLoop {
    link: Arc<BrokerLink>,
    handlers: Arc<RwLock<HandlerMap>>,
    limiter: Option<Arc<Semaphore>>,
    tracer: Arc<BoxedTracer>,
    subscription: Subscription,
}

impl DispatchLoop {
    async fn run(self, mut deliveries: DeliveryStream, mut generation: u64) {
        let mut generations = self.link.subscribe_generations();
        let mut shutdown = self.link.subscribe_shutdown();

        loop {
            while let Some(next) = deliveries.next().await {
                match next {
                    Ok(message) => self.dispatch(message).await,
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            if self.link.is_shut_down() {
                break;
            }

            warn!(
                queue = %self.subscription.queue,
                generation,
                "delivery stream ended, waiting for a new connection"
            );

            match self
                .resubscribe(&mut generations, &mut shutdown, generation)
                .await
            {
                Some((stream, current)) => {
                    deliveries = stream;
                    generation = current;
                }
                None => break,
            }
        }

        debug!(queue = %self.subscription.queue, "dispatch loop stopped");
    }

    /// Waits for a connection newer than `generation` and subscribes on it.
    ///
    /// A subscription refused by a live connection is retried every
    /// `reconnect_delay` on that same connection; once no connection is live
    /// the loop waits for the next one instead. Returns `None` once the link
    /// is closed.
    async fn resubscribe(
        &self,
        generations: &mut watch::Receiver<u64>,
        shutdown: &mut watch::Receiver<bool>,
        mut generation: u64,
    ) -> Option<(DeliveryStream, u64)> {
        let delay = self.link.settings().reconnect_delay;
        let mut await_connection = true;

        loop {
            if await_connection {
                tokio::select! {
                    _ = link::closed(shutdown) => return None,
                    changed = async {
                        generations.wait_for(|current| *current > generation).await.is_ok()
                    } => {
                        if !changed {
                            return None;
                        }
                    }
                }
                generation = self.link.generation();
            }

            match self.subscription.open(&self.link).await {
                Ok(stream) => {
                    info!(
                        queue = %self.subscription.queue,
                        generation,
                        "resumed consuming after reconnect"
                    );
                    return Some((stream, generation));
                }
                Err(AmqpError::NotInitializedError) => {
                    debug!(
                        queue = %self.subscription.queue,
                        generation,
                        "connection lost before resubscribing, waiting for the next one"
                    );
                    await_connection = true;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = %self.subscription.queue,
                        generation,
                        "failed to resubscribe, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = link::closed(shutdown) => return None,
                    }
                    await_connection = false;
                }
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        let permit = match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        };

        let handlers = self.handlers.clone();
        let tracer = self.tracer.clone();

        tokio::spawn(async move {
            let settlement: Settlement = process_message(&tracer, &handlers, message).await;
            debug!(?settlement, "delivery settled");
            drop(permit);
        });
    }
}
