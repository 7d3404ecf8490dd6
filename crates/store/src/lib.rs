//! kview store: revisioned snapshots, change capture and watch batching

#![forbid(unsafe_code)]

pub mod batch;
pub mod capture;
pub mod describe;
pub mod revision;

pub use batch::ChangeBatcher;
pub use capture::{build_changes, make_change, CaptureStore, ObjectSet};
pub use describe::{DescriptionFormatter, LocaleResources, DEFAULT_LOCALE};
pub use revision::RevisionStore;

use std::time::Duration;

use kview_core::WatchEvent;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Spawn a batching loop: events pushed on the returned sender come out on
/// `batches` every `flush` interval, deduplicated and revision-sorted.
pub fn spawn_batcher(cap: usize, flush: Duration, batches: mpsc::Sender<Vec<WatchEvent>>) -> mpsc::Sender<WatchEvent> {
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(cap.max(1));
    let flush = flush.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut batcher = ChangeBatcher::with_capacity(cap);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush, flush);
        loop {
            let closing = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(ev) => { batcher.push(ev); continue; }
                    None => {
                        debug!("event channel closed; draining and exiting batch loop");
                        true
                    }
                },
                _ = ticker.tick() => false,
            };
            let batch = batcher.drain_ready();
            if !batch.is_empty() {
                metrics::histogram!("batch_size", batch.len() as f64);
                if batches.send(batch).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        info!("batch loop stopped");
    });

    tx
}
