//! Incident lifecycle: the only place target status and incidents change.
//!
//! Every verdict for a target is applied under that target's lock. A verdict
//! older than the target's last check is discarded, so the newest observation
//! wins regardless of which path (probe sweep, watchdog, heartbeat signal)
//! delivered it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::consensus::{ConsensusVerdict, VerdictSource};
use crate::db::{
    CheckRecord, DbError, Incident, ResolutionMethod, StatusUpdate, Target, TargetStatus,
    TargetStore,
};
use crate::diagnostics::DiagnosticsScheduler;
use crate::notify::{DispatchReport, NotificationEvent, NotificationFanout};

/// Attempts for an incident create/close before giving up.
const INCIDENT_WRITE_ATTEMPTS: u32 = 3;
const INCIDENT_WRITE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("incident {operation} failed after {attempts} attempts: {source}")]
    IncidentWrite {
        operation: &'static str,
        attempts: u32,
        source: DbError,
    },
}

/// What applying a verdict did.
#[derive(Debug)]
pub enum Transition {
    /// up -> down: a new incident was opened.
    Opened {
        incident: Incident,
        notification: DispatchReport,
        diagnostics_scheduled: usize,
    },
    /// down -> up. `incident` is `None` when no open incident was found.
    Closed {
        incident: Option<Incident>,
        notification: DispatchReport,
    },
    /// Same status as before; only the last-checked data changed.
    Refreshed(TargetStatus),
    /// Older than the target's last check; ignored.
    Stale,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Opened { .. } => "opened",
            Transition::Closed { .. } => "closed",
            Transition::Refreshed(_) => "refreshed",
            Transition::Stale => "stale",
        }
    }
}

/// Per-target async locks, created on first use.
#[derive(Default)]
pub struct TargetLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, target_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(target_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock of a deleted target.
    pub fn forget(&self, target_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&target_id);
    }
}

/// Whole minutes between two instants, rounded to nearest.
pub fn duration_minutes(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    ((ended_at - started_at).num_milliseconds() as f64 / 60_000.0).round() as i64
}

async fn retry_incident_write<T>(
    operation: &'static str,
    target_id: i64,
    mut write: impl FnMut() -> Result<T, DbError>,
) -> Result<T, LifecycleError> {
    let mut attempt = 1;
    loop {
        match write() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < INCIDENT_WRITE_ATTEMPTS => {
                tracing::warn!(
                    target_id,
                    attempt,
                    "Incident {} failed, retrying: {}",
                    operation,
                    e
                );
                tokio::time::sleep(INCIDENT_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(source) => {
                tracing::error!(target_id, "Incident {} failed: {}", operation, source);
                return Err(LifecycleError::IncidentWrite {
                    operation,
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

pub struct IncidentLifecycle {
    store: Arc<dyn TargetStore>,
    fanout: Arc<NotificationFanout>,
    diagnostics: Arc<dyn DiagnosticsScheduler>,
    locks: Arc<TargetLocks>,
}

impl IncidentLifecycle {
    pub fn new(
        store: Arc<dyn TargetStore>,
        fanout: Arc<NotificationFanout>,
        diagnostics: Arc<dyn DiagnosticsScheduler>,
        locks: Arc<TargetLocks>,
    ) -> Self {
        Self {
            store,
            fanout,
            diagnostics,
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<TargetLocks> {
        &self.locks
    }

    /// Apply one verdict under the target's lock.
    pub async fn apply(&self, verdict: &ConsensusVerdict) -> Result<Transition, LifecycleError> {
        let _guard = self.locks.lock(verdict.target_id).await;
        self.apply_locked(verdict).await
    }

    /// Apply a verdict while the caller already holds the target's lock.
    pub async fn apply_locked(&self, verdict: &ConsensusVerdict) -> Result<Transition, LifecycleError> {
        let target = self.store.get_target(verdict.target_id)?;

        if let Some(last_checked) = target.last_checked_at {
            if verdict.timestamp < last_checked {
                tracing::debug!(
                    target_id = target.id,
                    "Discarding stale verdict from {} (last checked {})",
                    verdict.timestamp,
                    last_checked
                );
                return Ok(Transition::Stale);
            }
        }

        self.record_check(verdict);

        let update = StatusUpdate {
            status: verdict.status,
            checked_at: verdict.timestamp,
            latency_ms: verdict.mean_latency_ms,
            status_code: verdict.status_code,
        };
        let was_down = target.status == TargetStatus::Down;

        match (was_down, verdict.is_down()) {
            (false, true) => self.open(&target, verdict, &update).await,
            (true, false) => self.close(&target, verdict, &update).await,
            _ => {
                self.store.update_target_status(target.id, &update)?;
                Ok(Transition::Refreshed(verdict.status))
            }
        }
    }

    async fn open(
        &self,
        target: &Target,
        verdict: &ConsensusVerdict,
        update: &StatusUpdate,
    ) -> Result<Transition, LifecycleError> {
        self.store.update_target_status(target.id, update)?;

        let cause = verdict.cause();
        let store = self.store.clone();
        let opened = retry_incident_write("create", target.id, || {
            // A leftover open incident is reused so one target never has two.
            match store.find_open_incident(target.id)? {
                Some(existing) => Ok(existing),
                None => store.create_incident(target.id, verdict.timestamp, &cause),
            }
        })
        .await;

        let incident = match opened {
            Ok(incident) => incident,
            Err(e) => {
                // Roll the status back so the next verdict retries the transition.
                let revert = StatusUpdate {
                    status: target.status,
                    checked_at: target.last_checked_at.unwrap_or(verdict.timestamp),
                    latency_ms: None,
                    status_code: None,
                };
                if let Err(revert_err) = self.store.update_target_status(target.id, &revert) {
                    tracing::error!(
                        target_id = target.id,
                        "Failed to roll back status after incident write failure: {}",
                        revert_err
                    );
                }
                return Err(e);
            }
        };

        tracing::warn!(
            target_id = target.id,
            incident_id = incident.id,
            "{} is DOWN: {}",
            target.name,
            cause
        );

        let notification = self
            .fanout
            .dispatch(target, &NotificationEvent::down(target, verdict))
            .await;

        let diagnostics_scheduled =
            self.diagnostics
                .schedule(&incident, target, &verdict.failing_vantages());

        Ok(Transition::Opened {
            incident,
            notification,
            diagnostics_scheduled,
        })
    }

    async fn close(
        &self,
        target: &Target,
        verdict: &ConsensusVerdict,
        update: &StatusUpdate,
    ) -> Result<Transition, LifecycleError> {
        self.store.update_target_status(target.id, update)?;

        let store = self.store.clone();
        let open = retry_incident_write("lookup", target.id, || store.find_open_incident(target.id)).await?;

        let closed = match open {
            Some(mut incident) => {
                let ended_at = verdict.timestamp;
                incident.ended_at = Some(ended_at);
                incident.duration_minutes = Some(duration_minutes(incident.started_at, ended_at));
                incident.resolved = true;
                incident.resolution_method = Some(match verdict.source {
                    VerdictSource::Probe => ResolutionMethod::Probe,
                    VerdictSource::Heartbeat => ResolutionMethod::Heartbeat,
                });
                retry_incident_write("close", target.id, || store.close_incident(&incident)).await?;
                tracing::info!(
                    target_id = target.id,
                    incident_id = incident.id,
                    "{} RECOVERED after {} min",
                    target.name,
                    incident.duration_minutes.unwrap_or(0)
                );
                Some(incident)
            }
            None => {
                tracing::warn!(
                    target_id = target.id,
                    "{} recovered but no open incident was found",
                    target.name
                );
                None
            }
        };

        let downtime = closed.as_ref().and_then(|i| i.duration_minutes);
        let notification = self
            .fanout
            .dispatch(target, &NotificationEvent::up(target, verdict, downtime))
            .await;

        Ok(Transition::Closed {
            incident: closed,
            notification,
        })
    }

    fn record_check(&self, verdict: &ConsensusVerdict) {
        let check = CheckRecord {
            target_id: verdict.target_id,
            checked_at: verdict.timestamp,
            status: verdict.status,
            latency_ms: verdict.mean_latency_ms,
            status_code: verdict.status_code,
            error: verdict.error.clone(),
        };
        if let Err(e) = self.store.add_check(&check) {
            tracing::warn!(target_id = verdict.target_id, "Failed to record check: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::db::{
        ChannelConfig, HeartbeatSignal, OutcomeClass, ProbeOutcome, Store, TargetKind,
    };
    use crate::diagnostics::tests::RecordingScheduler;
    use crate::diagnostics::DiagnosticBundle;
    use crate::notify::tests::{Behavior, FakeAdapter};
    use crate::notify::{Channel, EventKind};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) struct Harness {
        pub store: Arc<Store>,
        pub lifecycle: Arc<IncidentLifecycle>,
        pub webhook: Arc<FakeAdapter>,
        pub diagnostics: Arc<RecordingScheduler>,
    }

    pub(crate) fn harness_with(store: Arc<dyn TargetStore>, inner: Arc<Store>) -> Harness {
        let webhook = FakeAdapter::new(Channel::Webhook, Behavior::Succeed);
        let fanout = Arc::new(NotificationFanout::new(
            vec![webhook.clone()],
            std::time::Duration::from_secs(5),
            Arc::new(MemoryStore::new(std::time::Duration::from_secs(60))),
        ));
        let diagnostics = Arc::new(RecordingScheduler::default());
        let lifecycle = Arc::new(IncidentLifecycle::new(
            store,
            fanout,
            diagnostics.clone(),
            Arc::new(TargetLocks::new()),
        ));
        Harness {
            store: inner,
            lifecycle,
            webhook,
            diagnostics,
        }
    }

    pub(crate) fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        harness_with(store.clone(), store)
    }

    pub(crate) fn add_target(store: &Store, kind: TargetKind) -> Target {
        let mut target = Target {
            name: "api".to_string(),
            kind,
            address: "https://api.example.com".to_string(),
            heartbeat_interval_secs: (kind == TargetKind::Heartbeat).then_some(60),
            channels: ChannelConfig {
                webhook: Some("https://hooks.example.com/x".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        target
    }

    pub(crate) fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub(crate) fn probe_verdict(target_id: i64, down: bool, at: DateTime<Utc>) -> ConsensusVerdict {
        let outcomes = ["us-east", "eu-west", "ap-south"]
            .iter()
            .map(|v| {
                if down {
                    ProbeOutcome::failed(v, OutcomeClass::Down, 40.0, "HTTP 503")
                        .with_status_code(503)
                } else {
                    ProbeOutcome::up(v, 40.0, Some(200))
                }
            })
            .collect();
        ConsensusVerdict {
            target_id,
            status: if down { TargetStatus::Down } else { TargetStatus::Up },
            outcomes,
            timestamp: at,
            mean_latency_ms: (!down).then_some(40.0),
            status_code: Some(if down { 503 } else { 200 }),
            error: down.then(|| "HTTP 503".to_string()),
            source: VerdictSource::Probe,
        }
    }

    #[tokio::test]
    async fn test_open_then_close_roundtrip() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);

        let opened = h
            .lifecycle
            .apply(&probe_verdict(target.id, true, t0()))
            .await
            .unwrap();
        let Transition::Opened {
            incident,
            notification,
            diagnostics_scheduled,
        } = opened
        else {
            panic!("expected Opened");
        };
        assert_eq!(incident.cause, "HTTP 503");
        assert!(notification.overall_success);
        assert_eq!(diagnostics_scheduled, 2);
        assert_eq!(h.diagnostics.tasks.lock().unwrap().len(), 2);
        assert_eq!(h.store.get_target(target.id).unwrap().status, TargetStatus::Down);

        let closed = h
            .lifecycle
            .apply(&probe_verdict(target.id, false, t0() + ChronoDuration::seconds(150)))
            .await
            .unwrap();
        let Transition::Closed { incident: Some(closed), .. } = closed else {
            panic!("expected Closed");
        };
        assert!(closed.resolved);
        assert_eq!(closed.ended_at, Some(t0() + ChronoDuration::seconds(150)));
        assert_eq!(closed.duration_minutes, Some(3));
        assert_eq!(closed.resolution_method, Some(ResolutionMethod::Probe));

        let incidents = h.store.get_incidents(target.id).unwrap();
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].resolved);
        assert_eq!(incidents[0].duration_minutes, Some(3));

        let kinds: Vec<EventKind> = h.webhook.sent().into_iter().map(|(_, k)| k).collect();
        assert_eq!(kinds, vec![EventKind::Down, EventKind::Up]);

        // One check per verdict feeds the SLA engine.
        let checks = h
            .store
            .get_checks(target.id, t0(), t0() + ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(checks.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_status_counts_as_up() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);
        assert_eq!(target.status, TargetStatus::Unknown);

        let first = h
            .lifecycle
            .apply(&probe_verdict(target.id, false, t0()))
            .await
            .unwrap();
        assert!(matches!(first, Transition::Refreshed(TargetStatus::Up)));
        assert!(h.webhook.sent().is_empty());

        let target = add_target(&h.store, TargetKind::Http);
        let down = h
            .lifecycle
            .apply(&probe_verdict(target.id, true, t0()))
            .await
            .unwrap();
        assert!(matches!(down, Transition::Opened { .. }));
    }

    #[tokio::test]
    async fn test_repeated_verdicts_are_idempotent() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);

        for i in 0..2 {
            let t = h
                .lifecycle
                .apply(&probe_verdict(target.id, false, t0() + ChronoDuration::minutes(i)))
                .await
                .unwrap();
            assert!(matches!(t, Transition::Refreshed(TargetStatus::Up)));
        }
        assert!(h.store.get_incidents(target.id).unwrap().is_empty());
        assert!(h.webhook.sent().is_empty());

        for i in 2..5 {
            h.lifecycle
                .apply(&probe_verdict(target.id, true, t0() + ChronoDuration::minutes(i)))
                .await
                .unwrap();
        }
        assert_eq!(h.store.get_incidents(target.id).unwrap().len(), 1);
        assert_eq!(h.webhook.sent().len(), 1);
        let refreshed = h.store.get_target(target.id).unwrap();
        assert_eq!(refreshed.last_checked_at, Some(t0() + ChronoDuration::minutes(4)));
    }

    #[tokio::test]
    async fn test_stale_verdict_is_discarded() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);

        h.lifecycle
            .apply(&probe_verdict(target.id, true, t0() + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        let stale = h
            .lifecycle
            .apply(&probe_verdict(target.id, false, t0()))
            .await
            .unwrap();
        assert!(matches!(stale, Transition::Stale));
        assert_eq!(h.store.get_target(target.id).unwrap().status, TargetStatus::Down);
        assert!(!h.store.get_incidents(target.id).unwrap()[0].resolved);
    }

    #[tokio::test]
    async fn test_recovery_without_open_incident_still_commits() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);
        h.store
            .update_target_status(
                target.id,
                &StatusUpdate {
                    status: TargetStatus::Down,
                    checked_at: t0(),
                    latency_ms: None,
                    status_code: None,
                },
            )
            .unwrap();

        let t = h
            .lifecycle
            .apply(&probe_verdict(target.id, false, t0() + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        assert!(matches!(t, Transition::Closed { incident: None, .. }));
        assert_eq!(h.store.get_target(target.id).unwrap().status, TargetStatus::Up);
        assert_eq!(h.webhook.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_verdicts_open_at_most_one_incident() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Http);

        let mut handles = Vec::new();
        for i in 0..20 {
            let lifecycle = h.lifecycle.clone();
            let verdict = probe_verdict(target.id, i % 3 != 0, t0() + ChronoDuration::seconds(i));
            handles.push(tokio::spawn(async move { lifecycle.apply(&verdict).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let incidents = h.store.get_incidents(target.id).unwrap();
        let open = incidents.iter().filter(|i| !i.resolved).count();
        assert!(open <= 1);
        // Incidents never overlap in time.
        let mut spans: Vec<_> = incidents
            .iter()
            .map(|i| (i.started_at, i.ended_at.unwrap_or(DateTime::<Utc>::MAX_UTC)))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_recovery_is_attributed() {
        let h = harness();
        let target = add_target(&h.store, TargetKind::Heartbeat);

        h.lifecycle
            .apply(&ConsensusVerdict::synthetic_down(
                target.id,
                "Missed heartbeat".to_string(),
                t0(),
            ))
            .await
            .unwrap();
        let t = h
            .lifecycle
            .apply(&ConsensusVerdict::heartbeat_up(
                target.id,
                Some(12.0),
                t0() + ChronoDuration::seconds(20),
            ))
            .await
            .unwrap();
        let Transition::Closed { incident: Some(incident), .. } = t else {
            panic!("expected Closed");
        };
        assert_eq!(incident.resolution_method, Some(ResolutionMethod::Heartbeat));
        assert_eq!(incident.duration_minutes, Some(0));
        assert_eq!(incident.cause, "Missed heartbeat");
    }

    /// Delegates to `Store` but fails the first `failures` incident creations.
    struct FlakyStore {
        inner: Arc<Store>,
        failures: AtomicU32,
    }

    impl TargetStore for FlakyStore {
        fn get_target(&self, id: i64) -> Result<Target, DbError> {
            self.inner.get_target(id)
        }
        fn get_targets(&self) -> Result<Vec<Target>, DbError> {
            self.inner.get_targets()
        }
        fn get_targets_by_kind(&self, kind: TargetKind) -> Result<Vec<Target>, DbError> {
            self.inner.get_targets_by_kind(kind)
        }
        fn update_target_status(&self, id: i64, update: &StatusUpdate) -> Result<(), DbError> {
            self.inner.update_target_status(id, update)
        }
        fn create_incident(
            &self,
            target_id: i64,
            started_at: DateTime<Utc>,
            cause: &str,
        ) -> Result<Incident, DbError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DbError::Poisoned);
            }
            self.inner.create_incident(target_id, started_at, cause)
        }
        fn find_open_incident(&self, target_id: i64) -> Result<Option<Incident>, DbError> {
            self.inner.find_open_incident(target_id)
        }
        fn close_incident(&self, incident: &Incident) -> Result<(), DbError> {
            self.inner.close_incident(incident)
        }
        fn get_incidents(&self, target_id: i64) -> Result<Vec<Incident>, DbError> {
            self.inner.get_incidents(target_id)
        }
        fn add_probe_outcomes(&self, target_id: i64, outcomes: &[ProbeOutcome]) -> Result<(), DbError> {
            self.inner.add_probe_outcomes(target_id, outcomes)
        }
        fn add_check(&self, check: &CheckRecord) -> Result<(), DbError> {
            self.inner.add_check(check)
        }
        fn get_checks(
            &self,
            target_id: i64,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<CheckRecord>, DbError> {
            self.inner.get_checks(target_id, start, end)
        }
        fn record_heartbeat_signal(&self, signal: &HeartbeatSignal) -> Result<(), DbError> {
            self.inner.record_heartbeat_signal(signal)
        }
        fn add_diagnostic_bundle(&self, bundle: &DiagnosticBundle) -> Result<(), DbError> {
            self.inner.add_diagnostic_bundle(bundle)
        }
    }

    fn flaky_harness(failures: u32) -> Harness {
        let inner = Arc::new(Store::open_in_memory().unwrap());
        let flaky = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicU32::new(failures),
        });
        harness_with(flaky, inner)
    }

    #[tokio::test(start_paused = true)]
    async fn test_incident_write_is_retried() {
        let h = flaky_harness(2);
        let target = add_target(&h.store, TargetKind::Http);

        let t = h
            .lifecycle
            .apply(&probe_verdict(target.id, true, t0()))
            .await
            .unwrap();
        assert!(matches!(t, Transition::Opened { .. }));
        assert_eq!(h.store.get_incidents(target.id).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incident_write_failure_is_surfaced_and_rolled_back() {
        let h = flaky_harness(3);
        let target = add_target(&h.store, TargetKind::Http);

        let err = h
            .lifecycle
            .apply(&probe_verdict(target.id, true, t0()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IncidentWrite {
                operation: "create",
                attempts: 3,
                ..
            }
        ));
        assert_ne!(h.store.get_target(target.id).unwrap().status, TargetStatus::Down);
        assert!(h.webhook.sent().is_empty());

        // The next verdict retries the transition and succeeds.
        let t = h
            .lifecycle
            .apply(&probe_verdict(target.id, true, t0() + ChronoDuration::minutes(1)))
            .await
            .unwrap();
        assert!(matches!(t, Transition::Opened { .. }));
        assert_eq!(h.store.get_incidents(target.id).unwrap().len(), 1);
    }

    #[test]
    fn test_duration_rounding() {
        assert_eq!(duration_minutes(t0(), t0() + ChronoDuration::seconds(89)), 1);
        assert_eq!(duration_minutes(t0(), t0() + ChronoDuration::seconds(90)), 2);
        assert_eq!(duration_minutes(t0(), t0() + ChronoDuration::seconds(29)), 0);
    }
}
