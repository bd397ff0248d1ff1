// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Link
//!
//! The [`BrokerLink`] owns the single live connection/channel pair of the
//! process. It is created once at startup, shared through an `Arc` by the
//! publisher and the dispatcher, and mutated only by [`BrokerLink::connect`].
//!
//! Every operation resolves the current session on its own, so callers always
//! observe the latest connection after a reconnect. While no session is live
//! (before the first connect, mid-reconnect, after close) operations fail fast
//! with [`AmqpError::NotInitializedError`].

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    publisher::JSON_CONTENT_TYPE,
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
    transport::{AmqpSession, CloseNotice, CloseNotifier, DeliveryStream, Transport},
};
use lapin::{types::ShortString, BasicProperties};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info};

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connection parameters of a [`BrokerLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub url: String,
    pub prefetch_count: u16,
    pub reconnect_delay: Duration,
}

struct LiveSession {
    generation: u64,
    session: Arc<dyn AmqpSession>,
}

/// Shared, self-healing handle on the broker connection.
pub struct BrokerLink {
    transport: Arc<dyn Transport>,
    settings: LinkSettings,
    live: RwLock<Option<LiveSession>>,
    connect_lock: Mutex<()>,
    reconnecting: Mutex<bool>,
    next_generation: AtomicU64,
    lost_generation: AtomicU64,
    connect_attempts: AtomicU64,
    generations: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    notices_tx: mpsc::UnboundedSender<CloseNotice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<CloseNotice>>>,
}

impl BrokerLink {
    /// Creates a link without connecting it.
    ///
    /// # Parameters
    /// * `transport` - Dials broker sessions
    /// * `settings` - Broker URL, prefetch count and reconnect delay
    ///
    /// # Returns
    /// An Arc-wrapped BrokerLink to share with publishers and consumers
    pub fn new(transport: Arc<dyn Transport>, settings: LinkSettings) -> Arc<BrokerLink> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (generations, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);

        Arc::new(BrokerLink {
            transport,
            settings,
            live: RwLock::new(None),
            connect_lock: Mutex::new(()),
            reconnecting: Mutex::new(false),
            next_generation: AtomicU64::new(0),
            lost_generation: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            generations,
            shutdown,
            notices_tx,
            notices_rx: Mutex::new(Some(notices_rx)),
        })
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Opens a fresh session and swaps it in.
    ///
    /// The dial happens outside the session lock; the exclusive lock is only
    /// held to replace the stored pair. On failure the stored state is left
    /// untouched. Any dial, channel or QoS failure is reported as
    /// `ConnectionError`.
    ///
    /// A session dialed while [`BrokerLink::close`] runs is closed again
    /// instead of being stored.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let _serial = self.connect_lock.lock().await;

        if self.is_shut_down() {
            return Err(AmqpError::ConnectionError("link is closed".to_owned()));
        }

        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = CloseNotifier::new(generation, self.notices_tx.clone());

        let session = self
            .transport
            .open(&self.settings.url, self.settings.prefetch_count, notifier)
            .await
            .map_err(|err| match err {
                AmqpError::ConnectionError(_) => err,
                other => AmqpError::ConnectionError(other.to_string()),
            })?;

        let previous = {
            let mut live = self.live.write().await;

            // close() flips the flag before taking the write lock
            if self.is_shut_down() {
                drop(live);
                debug!(generation, "link closed while dialing, discarding session");
                retire(session, generation).await;
                return Err(AmqpError::ConnectionError("link is closed".to_owned()));
            }

            live.replace(LiveSession {
                generation,
                session,
            })
        };
        self.generations.send_replace(generation);

        info!(generation, "successfully connected to rabbitmq");

        if let Some(previous) = previous {
            debug!(generation = previous.generation, "closing superseded session");
            tokio::spawn(retire(previous.session, previous.generation));
        }

        Ok(())
    }

    /// Returns the live session, or `NotInitializedError` when there is none.
    pub async fn get_channel(&self) -> Result<Arc<dyn AmqpSession>, AmqpError> {
        match self.live.read().await.as_ref() {
            Some(live) => Ok(live.session.clone()),
            None => Err(AmqpError::NotInitializedError),
        }
    }

    /// Health check: whether a session is currently live.
    pub async fn is_connected(&self) -> bool {
        self.get_channel().await.is_ok()
    }

    /// Generation of the most recently established session (0 before the
    /// first successful connect).
    pub fn generation(&self) -> u64 {
        *self.generations.borrow()
    }

    /// Watches the session generation; it changes on every successful connect.
    pub fn subscribe_generations(&self) -> watch::Receiver<u64> {
        self.generations.subscribe()
    }

    /// Number of connection attempts made so far, including failed ones.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Declares an exchange of the given kind (`direct`, `fanout`, `topic`
    /// or `headers`). The exchange is durable.
    pub async fn declare_exchange(&self, name: &str, kind: &str) -> Result<(), AmqpError> {
        let kind: ExchangeKind = kind.parse()?;
        self.declare_exchange_with(&ExchangeDefinition::new(name).kind(kind))
            .await
    }

    pub async fn declare_exchange_with(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.get_channel().await?.declare_exchange(def).await
    }

    /// Declares a durable, non-exclusive, non-auto-delete queue.
    pub async fn declare_queue(&self, name: &str) -> Result<DeclaredQueue, AmqpError> {
        self.declare_queue_with(&QueueDefinition::new(name)).await
    }

    pub async fn declare_queue_with(
        &self,
        def: &QueueDefinition,
    ) -> Result<DeclaredQueue, AmqpError> {
        self.get_channel().await?.declare_queue(def).await
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        self.get_channel().await?.bind_queue(&binding).await
    }

    /// Publishes `payload` as a persistent JSON message, bounded by `deadline`.
    pub async fn publish_raw(
        &self,
        deadline: Instant,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish_with_properties(
            deadline,
            exchange,
            routing_key,
            payload,
            BasicProperties::default(),
        )
        .await
    }

    /// Same as [`BrokerLink::publish_raw`] with caller supplied properties.
    /// Delivery mode and content type are always forced.
    pub async fn publish_with_properties(
        &self,
        deadline: Instant,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let session = self.get_channel().await?;

        let properties = properties
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE));

        match timeout_at(
            deadline,
            session.publish(exchange, routing_key, payload, properties),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AmqpError::PublishTimeout),
        }
    }

    /// Opens a manual-ack subscription on `queue` using the live session.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.get_channel().await?.consume(queue, consumer_tag).await
    }

    /// Closes the channel, then the connection, and stops reconnecting.
    ///
    /// A channel close failure is only logged; a connection close failure is
    /// returned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown.send_replace(true);

        let live = self.live.write().await.take();
        let Some(live) = live else {
            return Ok(());
        };

        if let Err(err) = live.session.close_channel().await {
            error!(error = err.to_string(), "failed to close channel");
        }

        live.session.close_connection().await?;
        info!(generation = live.generation, "rabbitmq connection closed");
        Ok(())
    }

    pub(crate) async fn take_close_notices(&self) -> Option<mpsc::UnboundedReceiver<CloseNotice>> {
        self.notices_rx.lock().await.take()
    }

    /// Records that the connection of `generation` was reported lost.
    pub(crate) fn mark_lost(&self, generation: u64) {
        self.lost_generation.fetch_max(generation, Ordering::SeqCst);
    }

    /// Claims the reconnect slot. Returns false when a reconnect is already
    /// running.
    pub(crate) async fn begin_reconnect(&self) -> bool {
        let mut reconnecting = self.reconnecting.lock().await;
        if *reconnecting {
            return false;
        }
        *reconnecting = true;
        true
    }

    /// Releases the reconnect slot after a successful connect, unless the
    /// session just installed has already been reported lost. In that case
    /// the slot stays claimed and false is returned.
    pub(crate) async fn finish_reconnect(&self) -> bool {
        let mut reconnecting = self.reconnecting.lock().await;
        let lost = self.lost_generation.load(Ordering::SeqCst);
        if lost > 0 && lost >= self.generation() {
            return false;
        }
        *reconnecting = false;
        true
    }

    /// Releases the reconnect slot unconditionally.
    pub(crate) async fn abandon_reconnect(&self) {
        *self.reconnecting.lock().await = false;
    }

    pub async fn is_reconnecting(&self) -> bool {
        *self.reconnecting.lock().await
    }

    /// Drops the stored session if it still belongs to `generation`.
    pub(crate) async fn invalidate(&self, generation: u64) -> bool {
        let mut live = self.live.write().await;
        match live.as_ref() {
            Some(current) if current.generation == generation => {
                live.take();
                debug!(generation, "dropped lost session");
                true
            }
            _ => false,
        }
    }
}

async fn retire(session: Arc<dyn AmqpSession>, generation: u64) {
    if let Err(err) = session.close_channel().await {
        debug!(error = err.to_string(), generation, "error closing retired channel");
    }
    if let Err(err) = session.close_connection().await {
        debug!(error = err.to_string(), generation, "error closing retired connection");
    }
}

/// Resolves once `shutdown` reports the link closed, or its sender is gone.
pub(crate) async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_helpers::{link_settings, FakeSession, FakeTransport},
        transport::MockAmqpSession,
    };

    #[tokio::test]
    async fn get_channel_before_connect_is_not_initialized() {
        let link = BrokerLink::new(FakeTransport::new(), link_settings());

        assert_eq!(
            link.get_channel().await.err(),
            Some(AmqpError::NotInitializedError)
        );
        assert!(!link.is_connected().await);
        assert_eq!(link.generation(), 0);
    }

    #[tokio::test]
    async fn connect_publishes_a_new_generation() {
        let transport = FakeTransport::new();
        transport.push_session(FakeSession::new());
        let link = BrokerLink::new(transport.clone(), link_settings());

        link.connect().await.unwrap();

        assert!(link.is_connected().await);
        assert_eq!(link.generation(), 1);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.prefetch_counts(), vec![10]);
    }

    #[tokio::test]
    async fn failed_connect_keeps_previous_session() {
        let transport = FakeTransport::new();
        let first = FakeSession::new();
        transport.push_session(first.clone());
        transport.push_failure(AmqpError::ChannelError("boom".to_owned()));
        let link = BrokerLink::new(transport.clone(), link_settings());

        link.connect().await.unwrap();
        let err = link.connect().await.unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConnectionError("failure to create a channel: boom".to_owned())
        );
        assert_eq!(link.generation(), 1);
        link.publish_raw(Instant::now() + Duration::from_secs(1), "ex", "key", b"{}")
            .await
            .unwrap();
        assert_eq!(first.published().len(), 1);
    }

    #[tokio::test]
    async fn declarations_use_the_live_session() {
        let transport = FakeTransport::new();
        let session = FakeSession::new();
        transport.push_session(session.clone());
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        link.declare_exchange("image_processing", "topic").await.unwrap();
        let queue = link.declare_queue("faces").await.unwrap();
        link.bind_queue(&queue.name, "image.received", "image_processing")
            .await
            .unwrap();

        let exchanges = session.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].exchange_kind(), ExchangeKind::Topic);
        assert!(exchanges[0].is_durable());
        assert_eq!(queue.name, "faces");
        assert_eq!(
            session.bindings(),
            vec![QueueBinding::new("faces")
                .exchange("image_processing")
                .routing_key("image.received")]
        );
    }

    #[tokio::test]
    async fn unknown_exchange_kind_is_rejected_before_the_broker() {
        let transport = FakeTransport::new();
        let session = FakeSession::new();
        transport.push_session(session.clone());
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        let err = link.declare_exchange("ex", "x-custom").await.unwrap_err();
        assert!(matches!(err, AmqpError::DeclareExchangeError(_)));
        assert!(session.exchanges().is_empty());
    }

    #[tokio::test]
    async fn publish_raw_marks_messages_persistent() {
        let transport = FakeTransport::new();
        let mut session = MockAmqpSession::new();
        session
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange.to_string() == "image_processing"
                    && key.to_string() == "image.received"
                    && payload.to_vec() == b"{}".to_vec()
                    && props.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
                    && props.content_type() == &Some(ShortString::from(JSON_CONTENT_TYPE))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        transport.push_session(Arc::new(session));
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        link.publish_raw(
            Instant::now() + Duration::from_secs(1),
            "image_processing",
            "image.received",
            b"{}",
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn publish_raw_honours_the_deadline() {
        let transport = FakeTransport::new();
        let session = FakeSession::new();
        session.set_publish_delay(Duration::from_secs(60));
        transport.push_session(session);
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        let err = link
            .publish_raw(Instant::now() + Duration::from_secs(2), "ex", "key", b"{}")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::PublishTimeout);
    }

    #[tokio::test]
    async fn close_returns_connection_error_even_if_channel_close_fails() {
        let transport = FakeTransport::new();
        let mut session = MockAmqpSession::new();
        session
            .expect_close_channel()
            .times(1)
            .returning(|| Err(AmqpError::ChannelError("already closed".to_owned())));
        session
            .expect_close_connection()
            .times(1)
            .returning(|| Err(AmqpError::CloseError("socket gone".to_owned())));
        transport.push_session(Arc::new(session));
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        let err = link.close().await.unwrap_err();

        assert_eq!(err, AmqpError::CloseError("socket gone".to_owned()));
        assert!(!link.is_connected().await);
        assert!(link.is_shut_down());
    }

    #[tokio::test]
    async fn connect_after_close_is_refused() {
        let transport = FakeTransport::new();
        transport.push_session(FakeSession::new());
        transport.push_session(FakeSession::new());
        let link = BrokerLink::new(transport.clone(), link_settings());
        link.connect().await.unwrap();
        link.close().await.unwrap();

        assert!(matches!(
            link.connect().await,
            Err(AmqpError::ConnectionError(_))
        ));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_slot_is_exclusive() {
        let link = BrokerLink::new(FakeTransport::new(), link_settings());

        assert!(link.begin_reconnect().await);
        assert!(!link.begin_reconnect().await);
        assert!(link.is_reconnecting().await);
        assert!(link.finish_reconnect().await);
        assert!(link.begin_reconnect().await);
    }

    #[tokio::test]
    async fn reconnect_slot_is_kept_while_the_new_session_is_lost() {
        let transport = FakeTransport::new();
        transport.push_session(FakeSession::new());
        let link = BrokerLink::new(transport, link_settings());

        assert!(link.begin_reconnect().await);
        link.connect().await.unwrap();
        link.mark_lost(1);

        assert!(!link.finish_reconnect().await);
        assert!(link.is_reconnecting().await);
        link.abandon_reconnect().await;
        assert!(!link.is_reconnecting().await);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_dial_discards_the_new_session() {
        let transport = FakeTransport::new();
        let session = FakeSession::new();
        transport.push_session(session.clone());
        transport.set_open_delay(Duration::from_secs(5));
        let link = BrokerLink::new(transport, link_settings());

        let dialing = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        link.close().await.unwrap();

        let result = dialing.await.unwrap();

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
        assert!(!link.is_connected().await);
        assert_eq!(link.generation(), 0);
        assert_eq!(session.closed_connections(), 1);
    }

    #[tokio::test]
    async fn invalidate_ignores_other_generations() {
        let transport = FakeTransport::new();
        transport.push_session(FakeSession::new());
        let link = BrokerLink::new(transport, link_settings());
        link.connect().await.unwrap();

        assert!(!link.invalidate(7).await);
        assert!(link.is_connected().await);
        assert!(link.invalidate(1).await);
        assert_eq!(
            link.get_channel().await.err(),
            Some(AmqpError::NotInitializedError)
        );
    }
}
