//! Scheduler module: the three periodic sweeps and the loops that drive them.

mod writer;

pub use writer::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cache::ExpiringStore;
use crate::config::ServerConfig;
use crate::consensus::LocationConsensus;
use crate::db::{DbError, Target, TargetKind, TargetStore};
use crate::heartbeat::HeartbeatWatchdog;
use crate::incident::{IncidentLifecycle, LifecycleError, Transition};
use crate::notify::{NotificationEvent, NotificationFanout};
use crate::sla::{self, SlaPolicy, SlaTarget};

/// Key of the SLA breach de-duplication store: (target id, SLA label).
pub type BreachKey = (i64, String);

/// How long a breach notification suppresses repeats for the same target and label.
pub const BREACH_NOTIFY_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Counters for one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub opened: usize,
    pub closed: usize,
    pub stale: usize,
    pub errors: usize,
    /// SLA sweep only.
    pub breaches_notified: usize,
}

impl SweepReport {
    fn record(&mut self, result: Result<Option<Transition>, LifecycleError>) {
        self.processed += 1;
        match result {
            Ok(Some(Transition::Opened { .. })) => self.opened += 1,
            Ok(Some(Transition::Closed { .. })) => self.closed += 1,
            Ok(Some(Transition::Stale)) => self.stale += 1,
            Ok(_) => {}
            Err(_) => self.errors += 1,
        }
    }
}

/// Cadence and batching of the sweeps.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub sweep_interval: Duration,
    pub sla_sweep_interval: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl From<&ServerConfig> for SweepConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval,
            sla_sweep_interval: config.sla_sweep_interval,
            batch_size: config.batch_size.max(1),
            batch_pause: config.batch_pause,
        }
    }
}

/// Run `work` over `items` in batches, pausing between batches.
async fn in_batches<'a, T, F, Fut, R>(items: &'a [T], size: usize, pause: Duration, work: F) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut results = Vec::with_capacity(items.len());
    let mut chunks = items.chunks(size.max(1)).peekable();
    while let Some(chunk) = chunks.next() {
        results.extend(futures::future::join_all(chunk.iter().map(&work)).await);
        if chunks.peek().is_some() && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    results
}

/// Owns the sweep entry points.
pub struct Scheduler {
    store: Arc<dyn TargetStore>,
    consensus: Arc<LocationConsensus>,
    lifecycle: Arc<IncidentLifecycle>,
    watchdog: Arc<HeartbeatWatchdog>,
    fanout: Arc<NotificationFanout>,
    breach_log: Arc<dyn ExpiringStore<BreachKey, ()>>,
    outcome_tx: mpsc::Sender<OutcomeBatch>,
    config: SweepConfig,
    sla_catalog: Vec<SlaTarget>,
    sla_policy: SlaPolicy,
}

impl Scheduler {
    /// Create a scheduler and start its outcome batch writer.
    pub fn new(
        store: Arc<dyn TargetStore>,
        consensus: Arc<LocationConsensus>,
        lifecycle: Arc<IncidentLifecycle>,
        watchdog: Arc<HeartbeatWatchdog>,
        fanout: Arc<NotificationFanout>,
        breach_log: Arc<dyn ExpiringStore<BreachKey, ()>>,
        config: SweepConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1000);

        // Start batch writer in a separate task
        tokio::spawn(run_batch_writer(rx, store.clone()));

        Self {
            store,
            consensus,
            lifecycle,
            watchdog,
            fanout,
            breach_log,
            outcome_tx: tx,
            config,
            sla_catalog: sla::default_catalog(),
            sla_policy: SlaPolicy::default(),
        }
    }

    pub fn with_sla_catalog(mut self, catalog: Vec<SlaTarget>) -> Self {
        self.sla_catalog = catalog;
        self
    }

    /// Probe every probed target once and apply the verdicts.
    pub async fn run_consensus_sweep(&self) -> Result<SweepReport, DbError> {
        let targets: Vec<Target> = self
            .store
            .get_targets()?
            .into_iter()
            .filter(|t| t.kind.is_probed())
            .collect();

        let results = in_batches(&targets, self.config.batch_size, self.config.batch_pause, |t| {
            self.evaluate(t)
        })
        .await;

        let mut report = SweepReport::default();
        for result in results {
            report.record(result.map(Some));
        }
        tracing::info!(
            processed = report.processed,
            opened = report.opened,
            closed = report.closed,
            errors = report.errors,
            "Consensus sweep complete"
        );
        Ok(report)
    }

    /// Consensus and lifecycle for one target, serialized on the target's lock.
    async fn evaluate(&self, target: &Target) -> Result<Transition, LifecycleError> {
        let _guard = self.lifecycle.locks().lock(target.id).await;
        let verdict = self.consensus.evaluate(target).await;

        let batch = OutcomeBatch {
            target_id: target.id,
            outcomes: verdict.outcomes.clone(),
        };
        if let Err(e) = self.outcome_tx.try_send(batch) {
            tracing::warn!(target_id = target.id, "Dropping probe outcomes: {}", e);
        }

        let result = self.lifecycle.apply_locked(&verdict).await;
        if let Err(e) = &result {
            tracing::error!(target_id = target.id, "Failed to apply verdict for {}: {}", target.name, e);
        }
        result
    }

    /// Check every heartbeat target for a missed signal.
    pub async fn run_heartbeat_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DbError> {
        let targets = self.store.get_targets_by_kind(TargetKind::Heartbeat)?;

        let results = in_batches(&targets, self.config.batch_size, self.config.batch_pause, |t| {
            let id = t.id;
            async move {
                let result = self.watchdog.check(id, now).await;
                if let Err(e) = &result {
                    tracing::error!(target_id = id, "Heartbeat check failed: {}", e);
                }
                result
            }
        })
        .await;

        let mut report = SweepReport::default();
        for result in results {
            report.record(result);
        }
        tracing::info!(
            processed = report.processed,
            opened = report.opened,
            "Heartbeat sweep complete"
        );
        Ok(report)
    }

    /// Evaluate the SLA catalog for every target and notify new breaches.
    pub async fn run_sla_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DbError> {
        let targets = self.store.get_targets()?;

        let results = in_batches(&targets, self.config.batch_size, self.config.batch_pause, |t| {
            self.check_sla(t, now)
        })
        .await;

        let mut report = SweepReport::default();
        for result in results {
            report.processed += 1;
            match result {
                Ok(notified) => report.breaches_notified += notified,
                Err(_) => report.errors += 1,
            }
        }
        tracing::info!(
            processed = report.processed,
            breaches = report.breaches_notified,
            "SLA sweep complete"
        );
        Ok(report)
    }

    async fn check_sla(&self, target: &Target, now: DateTime<Utc>) -> Result<usize, DbError> {
        let calculations = sla::evaluate_target(
            self.store.as_ref(),
            target.id,
            &self.sla_catalog,
            &self.sla_policy,
            now,
        )
        .map_err(|e| {
            tracing::error!(target_id = target.id, "SLA calculation failed: {}", e);
            e
        })?;

        let mut notified = 0;
        for breach in sla::detect_breaches(&calculations) {
            if !self.breach_log.claim((target.id, breach.label.clone()), ()) {
                continue;
            }
            tracing::warn!(target_id = target.id, "{} breached SLA {}", target.name, breach.label);
            let event = NotificationEvent::sla_breach(target, &breach);
            self.fanout.dispatch(target, &event).await;
            notified += 1;
        }
        Ok(notified)
    }

    /// Start the periodic sweep loops. They stop when `stop` fires.
    pub fn start(self: &Arc<Self>, stop: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting scheduler: sweeps every {:?}, SLA sweep every {:?}",
            self.config.sweep_interval,
            self.config.sla_sweep_interval
        );

        let consensus = {
            let this = self.clone();
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.sweep_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.run_consensus_sweep().await {
                                tracing::error!("Consensus sweep failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let heartbeat = {
            let this = self.clone();
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.sweep_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.run_heartbeat_sweep(Utc::now()).await {
                                tracing::error!("Heartbeat sweep failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let sla = {
            let this = self.clone();
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.sla_sweep_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.run_sla_sweep(Utc::now()).await {
                                tracing::error!("SLA sweep failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        vec![consensus, heartbeat, sla]
    }
}
