//! Ingress loop
//!
//! Drains swap events from a bounded channel into the engine. Every outcome
//! is logged and counted here; nothing is propagated, so one bad event or a
//! store hiccup never stops ingestion.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::swap::SwapEvent;

use crate::engine::{Engine, EngineError, IngestSnapshot};

/// Default capacity of the ingress channel.
pub const DEFAULT_EVENT_BUFFER: usize = 8192;

/// Consume events until `cancel` fires or every sender is dropped.
///
/// Returns the engine's counters at exit.
pub async fn run_ingress(
    engine: Arc<Engine>,
    mut rx: mpsc::Receiver<SwapEvent>,
    cancel: CancellationToken,
) -> IngestSnapshot {
    info!("Ingress started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Ingress cancelled");
                break;
            }
            next = rx.recv() => {
                let Some(event) = next else {
                    info!("Ingress channel closed");
                    break;
                };
                let outcome = engine.apply(&event).await;
                log_outcome(&event, &outcome);
            }
        }
    }

    let counters = engine.counters();
    info!(
        applied = counters.applied,
        duplicates = counters.duplicates,
        rejected = counters.rejected,
        failed = counters.failed,
        "Ingress stopped"
    );
    counters
}

fn log_outcome(event: &SwapEvent, outcome: &Result<bool, EngineError>) {
    match outcome {
        Ok(true) => {}
        Ok(false) => debug!(event_id = %event.event_id, token = %event.token, "Skipped duplicate"),
        Err(e @ EngineError::Store(_)) => {
            error!(event_id = %event.event_id, token = %event.token, error = %e, "Failed to apply event")
        }
        Err(e) => {
            warn!(event_id = %event.event_id, token = %event.token, error = %e, "Rejected event")
        }
    }
}
