//! Backlog reprocessor
//!
//! The notify channel is lossy by contract, so the listener reconciles
//! against the log: on every (re)subscribe and on a fixed interval, sweep
//! undispatched trigger events oldest-first and push each through the
//! same dispatch path as live traffic. Deterministic workflow ids make
//! the sweep safe to race with the listener and with other replicas.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use careflow_core::config::BacklogConfig;
use careflow_core::event::{AppendEvent, EventRecord};
use careflow_core::metadata::EventMetadata;
use careflow_store::append_with_retry;

use crate::processor::{TriggerError, TriggerMessage, TriggerOutcome, TriggerProcessor};

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogStats {
    pub scanned: usize,
    pub started: usize,
    pub deduplicated: usize,
    pub failed: usize,
    pub abandoned: usize,
}

/// Sweeps undispatched trigger events.
pub struct BacklogReprocessor {
    processor: Arc<TriggerProcessor>,
    config: BacklogConfig,
    trigger_types: Vec<String>,
}

impl BacklogReprocessor {
    pub fn new(processor: Arc<TriggerProcessor>, config: BacklogConfig) -> Self {
        let trigger_types = processor.registry().trigger_event_types();
        Self {
            processor,
            config,
            trigger_types,
        }
    }

    /// One sweep over the backlog, oldest events first, bounded
    /// concurrency.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<BacklogStats, TriggerError> {
        let events = self
            .processor
            .store()
            .unprocessed_triggers(&self.trigger_types, Duration::ZERO)
            .await?;

        if events.is_empty() {
            return Ok(BacklogStats::default());
        }

        info!(count = events.len(), "sweeping trigger backlog");

        let started = AtomicUsize::new(0);
        let deduplicated = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let abandoned = AtomicUsize::new(0);
        let scanned = events.len();

        futures::stream::iter(events)
            .for_each_concurrent(self.config.concurrency, |event| {
                let started = &started;
                let deduplicated = &deduplicated;
                let failed = &failed;
                let abandoned = &abandoned;
                async move {
                    if event.retry_count > self.config.max_retry {
                        match self.abandon(&event).await {
                            Ok(()) => {
                                abandoned.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                error!(event_id = %event.event_id, "failed to abandon trigger: {}", e);
                            }
                        }
                        return;
                    }

                    match self.processor.process(&TriggerMessage::from(&event)).await {
                        Ok(TriggerOutcome::Started(_)) => {
                            started.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(TriggerOutcome::Deduplicated(_)) => {
                            deduplicated.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(TriggerOutcome::Failed { .. }) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(TriggerOutcome::Rejected) => {}
                        Err(e) => {
                            error!(event_id = %event.event_id, "backlog dispatch error: {}", e);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let stats = BacklogStats {
            scanned,
            started: started.into_inner(),
            deduplicated: deduplicated.into_inner(),
            failed: failed.into_inner(),
            abandoned: abandoned.into_inner(),
        };
        info!(?stats, "backlog sweep finished");
        Ok(stats)
    }

    /// Periodic sweep until shutdown.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        // The listener already sweeps on subscribe; skip the immediate tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("backlog sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("backlog loop: shutdown requested");
                    break;
                }
            }
        }
    }

    /// Take a poisoned trigger out of the sweep: emit an alert event for
    /// manual triage and stamp the trigger as abandoned.
    async fn abandon(&self, event: &EventRecord) -> Result<(), TriggerError> {
        warn!(
            event_id = %event.event_id,
            retry_count = event.retry_count,
            "abandoning trigger event for manual triage"
        );

        let alert = AppendEvent::new(
            event.stream_id,
            event.stream_type.clone(),
            "workflow.trigger.abandoned",
            json!({
                "event_id": event.event_id,
                "event_type": event.event_type,
                "retry_count": event.retry_count,
                "error": event.processing_error,
            }),
        )
        .with_metadata(EventMetadata::default().with_correlation(event.event_id));

        append_with_retry(self.processor.store().as_ref(), alert, 5).await?;

        self.processor
            .store()
            .mark_abandoned(
                event.event_id,
                &format!("abandoned after {} dispatch attempts", event.retry_count),
            )
            .await?;
        Ok(())
    }
}
