//! Multi-location consensus.
//!
//! Probes one target from every vantage point concurrently under a shared
//! deadline and reduces the outcomes to a single up/down verdict by quorum.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::db::{OutcomeClass, ProbeOutcome, Target, TargetStatus};
use crate::probe::{Prober, VantagePoint};

/// Where a verdict came from; decides how a recovery is attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSource {
    Probe,
    Heartbeat,
}

/// A single up/down decision for one target.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusVerdict {
    pub target_id: i64,
    pub status: TargetStatus,
    pub outcomes: Vec<ProbeOutcome>,
    pub timestamp: DateTime<Utc>,
    /// Mean latency over `up` outcomes only.
    pub mean_latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub source: VerdictSource,
}

impl ConsensusVerdict {
    /// A down verdict without probe outcomes, e.g. a missed heartbeat.
    pub fn synthetic_down(target_id: i64, cause: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            target_id,
            status: TargetStatus::Down,
            outcomes: Vec::new(),
            timestamp,
            mean_latency_ms: None,
            status_code: None,
            error: Some(cause),
            source: VerdictSource::Heartbeat,
        }
    }

    /// An up verdict produced by a received heartbeat signal.
    pub fn heartbeat_up(target_id: i64, latency_ms: Option<f64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            target_id,
            status: TargetStatus::Up,
            outcomes: Vec::new(),
            timestamp,
            mean_latency_ms: latency_ms,
            status_code: None,
            error: None,
            source: VerdictSource::Heartbeat,
        }
    }

    pub fn is_down(&self) -> bool {
        self.status == TargetStatus::Down
    }

    /// Incident cause derived from the verdict's error text.
    pub fn cause(&self) -> String {
        self.error.clone().unwrap_or_else(|| "Unknown".to_string())
    }

    /// Vantage points whose outcome counted against the target.
    pub fn failing_vantages(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.class.is_failure())
            .map(|o| o.vantage.clone())
            .collect()
    }
}

/// Minimum failing vantage points needed to declare a target down.
///
/// Half rounded up below five points (1 of 2, 2 of 4), then a strict
/// majority (3 of 5, 4 of 6, 4 of 7).
pub fn threshold(n: usize) -> usize {
    if n < 5 {
        n.div_ceil(2)
    } else {
        n / 2 + 1
    }
}

/// Reduce per-location outcomes into a verdict.
///
/// `outcomes` holds whatever completed; any vantage point without an outcome
/// counts as a timeout.
pub fn reduce(
    target_id: i64,
    vantage_points: &[VantagePoint],
    mut outcomes: HashMap<String, ProbeOutcome>,
    deadline: Duration,
    timestamp: DateTime<Utc>,
) -> ConsensusVerdict {
    let ordered: Vec<ProbeOutcome> = vantage_points
        .iter()
        .map(|vp| {
            outcomes.remove(&vp.id).unwrap_or_else(|| {
                ProbeOutcome::failed(
                    &vp.id,
                    OutcomeClass::Timeout,
                    deadline.as_secs_f64() * 1000.0,
                    format!("no response within {:?}", deadline),
                )
            })
        })
        .collect();

    let n = vantage_points.len();
    let failures = ordered.iter().filter(|o| o.class.is_failure()).count();
    let status = if n > 0 && failures >= threshold(n) {
        TargetStatus::Down
    } else {
        TargetStatus::Up
    };

    let up_latencies: Vec<f64> = ordered
        .iter()
        .filter(|o| o.class == OutcomeClass::Up)
        .map(|o| o.latency_ms)
        .collect();
    let mean_latency_ms = if up_latencies.is_empty() {
        None
    } else {
        Some(up_latencies.iter().sum::<f64>() / up_latencies.len() as f64)
    };

    let status_code = ordered.iter().find_map(|o| o.status_code);
    let error = ordered.iter().find_map(|o| o.error.clone());

    ConsensusVerdict {
        target_id,
        status,
        outcomes: ordered,
        timestamp,
        mean_latency_ms,
        status_code,
        error,
        source: VerdictSource::Probe,
    }
}

/// Runs one target's probes across all vantage points.
pub struct LocationConsensus {
    prober: Arc<dyn Prober>,
    vantage_points: Vec<VantagePoint>,
    deadline: Duration,
}

impl LocationConsensus {
    pub fn new(prober: Arc<dyn Prober>, vantage_points: Vec<VantagePoint>, deadline: Duration) -> Self {
        Self {
            prober,
            vantage_points,
            deadline,
        }
    }

    pub fn vantage_points(&self) -> &[VantagePoint] {
        &self.vantage_points
    }

    /// Probe `target` from every vantage point and return the quorum verdict.
    ///
    /// Probes still running at the shared deadline are aborted and count as timeouts.
    pub async fn evaluate(&self, target: &Target) -> ConsensusVerdict {
        let deadline = Instant::now() + self.deadline;
        let mut set = JoinSet::new();

        for vantage in &self.vantage_points {
            let prober = self.prober.clone();
            let target = target.clone();
            let vantage = vantage.clone();
            let timeout = self.deadline;

            set.spawn(async move {
                let id = vantage.id.clone();
                AssertUnwindSafe(prober.probe(&target, &vantage, timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        ProbeOutcome::failed(&id, OutcomeClass::Error, 0.0, "probe task panicked")
                    })
            });
        }

        let mut outcomes = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    outcomes.insert(outcome.vantage.clone(), outcome);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(target_id = target.id, "probe task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        target_id = target.id,
                        pending = set.len(),
                        "consensus deadline reached with probes outstanding"
                    );
                    set.abort_all();
                    break;
                }
            }
        }

        let verdict = reduce(target.id, &self.vantage_points, outcomes, self.deadline, Utc::now());
        tracing::debug!(
            target_id = target.id,
            status = %verdict.status,
            failing = verdict.failing_vantages().len(),
            total = self.vantage_points.len(),
            "consensus reached"
        );
        verdict
    }
}
