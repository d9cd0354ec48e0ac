//! Dead-man switch for push-based targets.
//!
//! The watchdog only ever marks heartbeat targets down. Recovery comes from
//! `HeartbeatReceiver`, so it happens as soon as a signal lands rather than on
//! the next sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::consensus::ConsensusVerdict;
use crate::db::{DbError, HeartbeatSignal, Target, TargetKind, TargetStatus, TargetStore};
use crate::incident::{IncidentLifecycle, LifecycleError, Transition};

/// Lower bound of the grace period.
pub const MIN_GRACE_SECS: f64 = 30.0;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("target {0} not found")]
    NotFound(i64),
    #[error("target {0} is not a heartbeat target")]
    NotHeartbeat(i64),
    #[error("store error: {0}")]
    Store(DbError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<DbError> for HeartbeatError {
    fn from(e: DbError) -> Self {
        HeartbeatError::Store(e)
    }
}

/// `max(30s, interval / 2)`.
pub fn grace_period(interval_secs: u64) -> Duration {
    let secs = (interval_secs as f64 * 0.5).max(MIN_GRACE_SECS);
    Duration::milliseconds((secs * 1000.0) as i64)
}

fn expected_interval(target: &Target) -> u64 {
    target.heartbeat_interval_secs.unwrap_or(target.interval_secs)
}

/// When a target with this last signal becomes overdue. "Never" counts from the Unix epoch.
pub fn overdue_at(last_signal: Option<DateTime<Utc>>, interval_secs: u64) -> DateTime<Utc> {
    let base = last_signal.unwrap_or(DateTime::UNIX_EPOCH);
    base + Duration::seconds(interval_secs as i64) + grace_period(interval_secs)
}

pub fn is_overdue(target: &Target, now: DateTime<Utc>) -> bool {
    now > overdue_at(target.last_signal_at, expected_interval(target))
}

/// Incident cause for a missed heartbeat.
pub fn missed_cause(interval_secs: u64, last_signal: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match last_signal {
        Some(last) => format!(
            "Missed heartbeat (expected every {}s, last seen {}s ago)",
            interval_secs,
            (now - last).num_seconds()
        ),
        None => format!(
            "Missed heartbeat (expected every {}s, never seen)",
            interval_secs
        ),
    }
}

/// Marks overdue heartbeat targets down.
pub struct HeartbeatWatchdog {
    store: Arc<dyn TargetStore>,
    lifecycle: Arc<IncidentLifecycle>,
}

impl HeartbeatWatchdog {
    pub fn new(store: Arc<dyn TargetStore>, lifecycle: Arc<IncidentLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    /// Check one target. Returns the transition when a down verdict was applied.
    pub async fn check(&self, target_id: i64, now: DateTime<Utc>) -> Result<Option<Transition>, LifecycleError> {
        let _guard = self.lifecycle.locks().lock(target_id).await;
        // Re-read under the lock: a signal may have landed since the sweep listed targets.
        let target = self.store.get_target(target_id)?;

        if target.kind != TargetKind::Heartbeat || target.status == TargetStatus::Down {
            return Ok(None);
        }
        if !is_overdue(&target, now) {
            return Ok(None);
        }

        let interval = expected_interval(&target);
        let cause = missed_cause(interval, target.last_signal_at, now);
        tracing::info!(target_id, "{}: {}", target.name, cause);

        let verdict = ConsensusVerdict::synthetic_down(target_id, cause, now);
        self.lifecycle.apply_locked(&verdict).await.map(Some)
    }
}

/// Optional body of a heartbeat ping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalPayload {
    pub status: Option<String>,
    pub latency_ms: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

impl SignalPayload {
    /// The sender reported its own failure.
    fn reported_failure(&self) -> Option<&str> {
        self.status
            .as_deref()
            .filter(|s| matches!(s.to_ascii_lowercase().as_str(), "down" | "fail" | "failed" | "error"))
    }
}

/// Ingress for "I'm alive" signals.
pub struct HeartbeatReceiver {
    store: Arc<dyn TargetStore>,
    lifecycle: Arc<IncidentLifecycle>,
}

impl HeartbeatReceiver {
    pub fn new(store: Arc<dyn TargetStore>, lifecycle: Arc<IncidentLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    /// Record the signal and apply it. A `down` target recovers here.
    pub async fn receive(
        &self,
        target_id: i64,
        payload: SignalPayload,
        received_at: DateTime<Utc>,
    ) -> Result<Transition, HeartbeatError> {
        let _guard = self.lifecycle.locks().lock(target_id).await;

        let target = match self.store.get_target(target_id) {
            Ok(target) => target,
            Err(DbError::NotFound) => return Err(HeartbeatError::NotFound(target_id)),
            Err(e) => return Err(e.into()),
        };
        if target.kind != TargetKind::Heartbeat {
            return Err(HeartbeatError::NotHeartbeat(target_id));
        }

        let signal = HeartbeatSignal {
            target_id,
            received_at,
            status: payload.status.clone(),
            latency_ms: payload.latency_ms,
            metadata: payload.metadata.clone(),
        };
        self.store.record_heartbeat_signal(&signal)?;
        tracing::debug!(target_id, "Heartbeat received for {}", target.name);

        let verdict = match payload.reported_failure() {
            Some(status) => ConsensusVerdict::synthetic_down(
                target_id,
                format!("Heartbeat reported status: {}", status),
                received_at,
            ),
            None => ConsensusVerdict::heartbeat_up(target_id, payload.latency_ms, received_at),
        };
        Ok(self.lifecycle.apply_locked(&verdict).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ResolutionMethod;
    use crate::incident::tests::{add_target, harness, t0};
    use crate::notify::EventKind;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_grace_period() {
        assert_eq!(grace_period(60), Duration::seconds(30));
        assert_eq!(grace_period(20), Duration::seconds(30));
        assert_eq!(grace_period(300), Duration::seconds(150));
        assert_eq!(grace_period(61), Duration::milliseconds(30_500));
    }

    #[test]
    fn test_never_signalled_is_overdue() {
        let overdue = overdue_at(None, 60);
        assert_eq!(overdue, DateTime::UNIX_EPOCH + Duration::seconds(90));
        let target = Target {
            kind: TargetKind::Heartbeat,
            heartbeat_interval_secs: Some(60),
            ..Default::default()
        };
        assert!(is_overdue(&target, t0()));
    }

    #[test]
    fn test_overdue_boundary() {
        let target = Target {
            kind: TargetKind::Heartbeat,
            heartbeat_interval_secs: Some(60),
            last_signal_at: Some(t0()),
            ..Default::default()
        };
        assert!(!is_overdue(&target, t0() + Duration::seconds(90)));
        assert!(is_overdue(&target, t0() + Duration::seconds(91)));
    }

    #[test]
    fn test_missed_cause_text() {
        assert_eq!(
            missed_cause(60, Some(t0()), t0() + Duration::seconds(95)),
            "Missed heartbeat (expected every 60s, last seen 95s ago)"
        );
        assert_eq!(
            missed_cause(60, None, t0()),
            "Missed heartbeat (expected every 60s, never seen)"
        );
    }

    #[tokio::test]
    async fn test_watchdog_marks_silent_target_down_once() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Heartbeat);
        let watchdog = HeartbeatWatchdog::new(h.store.clone(), h.lifecycle.clone());

        let first = watchdog.check(target.id, t0()).await.unwrap();
        assert!(matches!(first, Some(Transition::Opened { .. })));
        let incidents = h.store.get_incidents(target.id).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].cause, "Missed heartbeat (expected every 60s, never seen)");

        // Already down: skipped.
        let second = watchdog
            .check(target.id, t0() + Duration::minutes(10))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(h.store.get_incidents(target.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watchdog_ignores_fresh_and_probed_targets() {
        let h = harness();
        let watchdog = HeartbeatWatchdog::new(h.store.clone(), h.lifecycle.clone());
        let receiver = HeartbeatReceiver::new(h.store.clone(), h.lifecycle.clone());

        let fresh = add_target(&h.store, TargetKind::Heartbeat);
        receiver
            .receive(fresh.id, SignalPayload::default(), t0())
            .await
            .unwrap();
        let result = watchdog
            .check(fresh.id, t0() + Duration::seconds(60))
            .await
            .unwrap();
        assert!(result.is_none());

        let http = add_target(&h.store, TargetKind::Http);
        assert!(watchdog.check(http.id, t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signal_recovers_down_target() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Heartbeat);
        let watchdog = HeartbeatWatchdog::new(h.store.clone(), h.lifecycle.clone());
        let receiver = HeartbeatReceiver::new(h.store.clone(), h.lifecycle.clone());

        watchdog.check(target.id, t0()).await.unwrap();
        let payload = SignalPayload {
            latency_ms: Some(85.0),
            metadata: Some(serde_json::json!({"job": "nightly-backup"})),
            ..Default::default()
        };
        let t = assert_ok!(
            receiver
                .receive(target.id, payload, t0() + Duration::minutes(4))
                .await
        );
        let Transition::Closed { incident: Some(incident), .. } = t else {
            panic!("expected Closed");
        };
        assert_eq!(incident.resolution_method, Some(ResolutionMethod::Heartbeat));
        assert_eq!(incident.duration_minutes, Some(4));

        let target = h.store.get_target(target.id).unwrap();
        assert_eq!(target.status, TargetStatus::Up);
        assert_eq!(target.last_signal_at, Some(t0() + Duration::minutes(4)));

        let kinds: Vec<EventKind> = h.webhook.sent().into_iter().map(|(_, k)| k).collect();
        assert_eq!(kinds, vec![EventKind::Down, EventKind::Up]);
    }

    #[tokio::test]
    async fn test_reported_failure_opens_incident() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Heartbeat);
        let receiver = HeartbeatReceiver::new(h.store.clone(), h.lifecycle.clone());

        let payload = SignalPayload {
            status: Some("FAILED".to_string()),
            ..Default::default()
        };
        let t = assert_ok!(receiver.receive(target.id, payload, t0()).await);
        assert!(matches!(t, Transition::Opened { .. }));
        assert_eq!(
            h.store.get_incidents(target.id).unwrap()[0].cause,
            "Heartbeat reported status: FAILED"
        );
    }

    #[tokio::test]
    async fn test_receiver_rejects_unknown_and_probed_targets() {
        let h = harness();
        let receiver = HeartbeatReceiver::new(h.store.clone(), h.lifecycle.clone());
        let http = add_target(&h.store, TargetKind::Http);

        let err = assert_err!(receiver.receive(9999, SignalPayload::default(), t0()).await);
        assert!(matches!(err, HeartbeatError::NotFound(9999)));
        assert!(matches!(
            receiver.receive(http.id, SignalPayload::default(), t0()).await,
            Err(HeartbeatError::NotHeartbeat(_))
        ));
    }
}
