// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Supervisor
//!
//! Background task watching for unexpected connection closure. When the live
//! connection drops, the supervisor invalidates it and starts a reconnect loop
//! that retries [`BrokerLink::connect`] every `reconnect_delay` until it
//! succeeds. There is no attempt limit: the link keeps trying for as long as
//! it is open.
//!
//! At most one reconnect loop runs at any time. Notices arriving while one is
//! running are rejected by the link's reconnect flag, and notices raised by a
//! connection generation that has already been replaced are ignored. A notice
//! for the generation the running loop is installing is recorded on the link,
//! and the loop keeps going until it leaves a session that is not known lost.

use crate::{
    errors::AmqpError,
    link::{self, BrokerLink},
    transport::CloseNotice,
};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub struct ReconnectSupervisor;

impl ReconnectSupervisor {
    /// Starts supervising `link`.
    ///
    /// The task ends once the link is closed. A link can only be supervised
    /// once; a second call fails with `InternalError`.
    pub async fn spawn(link: Arc<BrokerLink>) -> Result<JoinHandle<()>, AmqpError> {
        let Some(notices) = link.take_close_notices().await else {
            error!("link is already supervised");
            return Err(AmqpError::InternalError);
        };

        Ok(tokio::spawn(Self::run(link, notices)))
    }

    async fn run(link: Arc<BrokerLink>, mut notices: mpsc::UnboundedReceiver<CloseNotice>) {
        let mut shutdown = link.subscribe_shutdown();

        loop {
            tokio::select! {
                _ = link::closed(&mut shutdown) => {
                    debug!("link closed, reconnect supervisor stopping");
                    break;
                }
                notice = notices.recv() => {
                    let Some(notice) = notice else {
                        break;
                    };
                    Self::on_close(&link, notice).await;
                }
            }
        }
    }

    async fn on_close(link: &Arc<BrokerLink>, notice: CloseNotice) {
        if link.is_shut_down() {
            return;
        }

        if notice.generation < link.generation() {
            debug!(
                generation = notice.generation,
                current = link.generation(),
                "ignoring close notice from a replaced connection"
            );
            return;
        }

        error!(
            reason = %notice.reason,
            generation = notice.generation,
            "rabbitmq connection closed"
        );

        link.mark_lost(notice.generation);
        if !link.begin_reconnect().await {
            debug!(
                generation = notice.generation,
                "reconnection already in progress"
            );
            return;
        }

        link.invalidate(notice.generation).await;
        tokio::spawn(Self::reconnect(link.clone()));
    }

    /// Retries `connect` until it installs a session that has not been
    /// reported lost, or the link is closed. The caller must hold the
    /// reconnect slot; it is released on exit.
    async fn reconnect(link: Arc<BrokerLink>) {
        let mut shutdown = link.subscribe_shutdown();
        let delay = link.settings().reconnect_delay;
        let mut attempt: u64 = 0;

        loop {
            if link.is_shut_down() {
                break;
            }

            attempt += 1;
            info!(attempt, "attempting to reconnect to rabbitmq...");

            match link.connect().await {
                Ok(()) => {
                    let generation = link.generation();
                    if link.finish_reconnect().await {
                        info!(attempt, generation, "reconnected to rabbitmq");
                        return;
                    }
                    warn!(attempt, generation, "new connection was lost while reconnecting");
                    link.invalidate(generation).await;
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "failed to reconnect");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = link::closed(&mut shutdown) => break,
            }
        }

        link.abandon_reconnect().await;
    }
}
