//! Background writer for per-vantage probe outcomes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::db::{ProbeOutcome, TargetStore};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_ROWS: usize = 500;

/// Outcomes of one consensus round.
#[derive(Debug)]
pub struct OutcomeBatch {
    pub target_id: i64,
    pub outcomes: Vec<ProbeOutcome>,
}

/// Accumulate outcome batches and flush them every 2s or at 500 rows.
pub async fn run_batch_writer(mut rx: mpsc::Receiver<OutcomeBatch>, store: Arc<dyn TargetStore>) {
    let mut buffer: Vec<OutcomeBatch> = Vec::with_capacity(100);
    let mut rows = 0;
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            batch = rx.recv() => {
                match batch {
                    Some(b) => {
                        rows += b.outcomes.len();
                        buffer.push(b);
                        if rows >= FLUSH_ROWS {
                            flush_buffer(store.as_ref(), &mut buffer);
                            rows = 0;
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(store.as_ref(), &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(store.as_ref(), &mut buffer);
                rows = 0;
            }
        }
    }
}

fn flush_buffer(store: &dyn TargetStore, buffer: &mut Vec<OutcomeBatch>) {
    if buffer.is_empty() {
        return;
    }

    let mut by_target: BTreeMap<i64, Vec<ProbeOutcome>> = BTreeMap::new();
    for batch in buffer.drain(..) {
        by_target
            .entry(batch.target_id)
            .or_default()
            .extend(batch.outcomes);
    }

    for (target_id, outcomes) in by_target {
        if let Err(e) = store.add_probe_outcomes(target_id, &outcomes) {
            tracing::error!(target_id, "Failed to flush {} probe outcomes: {}", outcomes.len(), e);
        }
    }
}
