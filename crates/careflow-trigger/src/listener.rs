//! Workflow trigger listener
//!
//! A single-consumer loop over the workflow notify channel. Safe to run
//! in multiple replicas: deterministic workflow ids make concurrent
//! dispatches idempotent, one replica wins and the rest see
//! `AlreadyExists`.
//!
//! The subscription is assumed lossy. On every (re)subscribe the listener
//! runs a backlog sweep before consuming live traffic, and reconnects
//! with jittered exponential backoff when the channel drops.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use careflow_core::config::ListenerConfig;
use careflow_store::{NotifyBus, NotifyError, NotifyPayload};

use crate::backlog::BacklogReprocessor;
use crate::processor::{TriggerMessage, TriggerProcessor};

/// The notify-driven trigger listener.
pub struct TriggerListener {
    processor: Arc<TriggerProcessor>,
    backlog: Arc<BacklogReprocessor>,
    bus: Arc<dyn NotifyBus>,
    config: ListenerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TriggerListener {
    pub fn new(
        processor: Arc<TriggerProcessor>,
        backlog: Arc<BacklogReprocessor>,
        bus: Arc<dyn NotifyBus>,
        config: ListenerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            processor,
            backlog,
            bus,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Stop accepting notifications; the run loop finishes its in-flight
    /// dispatch and closes the subscription.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Main loop: subscribe, sweep, consume; reconnect on drop.
    #[instrument(skip(self), fields(channel = %self.config.channel_name))]
    pub async fn run(&self) {
        let mut reconnect_attempt: u32 = 0;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut subscription = match self.bus.subscribe(&self.config.channel_name).await {
                Ok(subscription) => {
                    info!("subscribed to workflow channel");
                    reconnect_attempt = 0;
                    subscription
                }
                Err(e) => {
                    reconnect_attempt += 1;
                    let delay = self
                        .config
                        .reconnect_backoff
                        .delay_for_attempt(reconnect_attempt);
                    warn!(attempt = reconnect_attempt, ?delay, "subscribe failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            };

            // Reconcile what the channel missed while we were away.
            if let Err(e) = self.backlog.run_once().await {
                error!("startup backlog sweep failed: {}", e);
            }

            // Live traffic until the subscription drops or shutdown.
            loop {
                tokio::select! {
                    received = subscription.recv() => match received {
                        Ok(payload) => self.handle(payload).await,
                        Err(NotifyError::Lagged(n)) => {
                            warn!(dropped = n, "subscriber lagged; sweeping backlog");
                            if let Err(e) = self.backlog.run_once().await {
                                error!("lag backlog sweep failed: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("subscription dropped: {}", e);
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        info!("listener shutting down");
                        return;
                    }
                }
            }

            // The subscription dropped; back off before resubscribing.
            reconnect_attempt += 1;
            let delay = self
                .config
                .reconnect_backoff
                .delay_for_attempt(reconnect_attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    /// Dispatch one notification.
    async fn handle(&self, payload: NotifyPayload) {
        let message = match payload.event {
            Some(event) => TriggerMessage::from_notified(payload.event_id, event),
            None => {
                // Oversized payloads degrade to a reference; re-fetch.
                match self.processor.store().get_event(payload.event_id).await {
                    Ok(record) => TriggerMessage::from(&record),
                    Err(e) => {
                        error!(event_id = %payload.event_id, "failed to fetch referenced event: {}", e);
                        return;
                    }
                }
            }
        };

        match self.processor.process(&message).await {
            Ok(outcome) => {
                debug!(event_id = %message.event_id, ?outcome, "dispatched notification")
            }
            Err(e) => {
                error!(event_id = %message.event_id, "dispatch bookkeeping failed: {}", e)
            }
        }
    }
}
