//! Forensic snapshots collected when an incident opens.
//!
//! Collection is best-effort: each section can fail on its own, persistence
//! errors are logged and dropped, and the work runs on a bounded background
//! pool that the incident path never waits on.

mod lookups;

pub use lookups::*;

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::db::{Incident, Target, TargetKind, TargetStore};
use crate::probe::strip_scheme;

/// Most vantage points diagnosed for a single incident.
pub const MAX_VANTAGES_PER_INCIDENT: usize = 2;

/// One section of a bundle: the lookup's result or why it is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "lowercase")]
pub enum Section<T> {
    Ok(T),
    Failed { error: String },
    Skipped { reason: String },
}

impl<T> Section<T> {
    pub fn from_result(result: Result<T, LookupError>) -> Self {
        match result {
            Ok(value) => Section::Ok(value),
            Err(LookupError::NotApplicable(reason)) => Section::Skipped { reason },
            Err(e) => Section::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn ok(&self) -> Option<&T> {
        match self {
            Section::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Section::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsResult {
    pub resolver: String,
    pub query_ms: f64,
    pub records: Vec<DnsRecord>,
}

impl DnsResult {
    /// A and AAAA record addresses, in answer order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.records
            .iter()
            .filter(|r| r.record_type == "A" || r.record_type == "AAAA")
            .filter_map(|r| r.value.parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHop {
    pub hop: u32,
    pub address: Option<String>,
    pub rtts_ms: Vec<f64>,
    pub loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub hops: Vec<TraceHop>,
    /// The last hop answered.
    pub completed: bool,
}

/// Milliseconds from the start of the request to the end of each phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTiming {
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: Option<f64>,
    pub first_byte_ms: f64,
    pub total_ms: f64,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsDetail {
    pub subject: String,
    pub issuer: String,
    pub sans: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_remaining: i64,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoDetail {
    pub ip: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub cdn: Option<String>,
}

/// Snapshot for one incident as seen for one vantage point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub incident_id: i64,
    pub vantage: String,
    pub collected_at: DateTime<Utc>,
    pub dns: Section<DnsResult>,
    pub trace: Section<TraceResult>,
    pub http_timing: Section<HttpTiming>,
    pub tls: Section<TlsDetail>,
    pub geo: Section<GeoDetail>,
}

/// The lookup services used by a collector.
#[derive(Clone)]
pub struct Lookups {
    pub dns: Arc<dyn DnsResolver>,
    pub tracer: Arc<dyn PathTracer>,
    pub http: Arc<dyn HttpTimer>,
    pub tls: Arc<dyn TlsInspector>,
    pub geo: Arc<dyn GeoLookup>,
}

impl Lookups {
    /// Default services; TLS results are cached in `tls_cache`.
    pub fn system(
        tls_cache: Arc<dyn crate::cache::ExpiringStore<String, TlsDetail>>,
    ) -> Result<Self, LookupError> {
        Ok(Self {
            dns: Arc::new(DohResolver::new(DohResolver::DEFAULT_ENDPOINT)?),
            tracer: Arc::new(TracerouteTracer::default()),
            http: Arc::new(ManualHttpTimer::new()?),
            tls: Arc::new(RustlsInspector::new(tls_cache)?),
            geo: Arc::new(IpApiGeo::new(IpApiGeo::DEFAULT_ENDPOINT)?),
        })
    }
}

/// Host and port a target's lookups should aim at.
fn endpoint_of(target: &Target) -> (String, u16) {
    let default_port = match target.kind {
        TargetKind::Http if target.address.starts_with("https://") => 443,
        TargetKind::Http => 80,
        _ => 443,
    };
    let host_port = strip_scheme(&target.address);
    // Bracketed IPv6 literal, optionally with a port.
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(target.port.unwrap_or(default_port));
            return (host.to_string(), port);
        }
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (
            host.to_string(),
            port.parse().unwrap_or(target.port.unwrap_or(default_port)),
        ),
        _ => (host_port.to_string(), target.port.unwrap_or(default_port)),
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, LookupError>>,
) -> Result<T, LookupError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(LookupError::Timeout(limit)))
}

/// Runs every lookup for one incident and vantage point.
pub struct DiagnosticsCollector {
    lookups: Lookups,
    store: Arc<dyn TargetStore>,
    lookup_timeout: Duration,
}

impl DiagnosticsCollector {
    pub fn new(lookups: Lookups, store: Arc<dyn TargetStore>, lookup_timeout: Duration) -> Self {
        Self {
            lookups,
            store,
            lookup_timeout,
        }
    }

    /// Build a bundle. Every section is independent; none can fail the bundle.
    pub async fn collect(&self, incident: &Incident, target: &Target, vantage: &str) -> DiagnosticBundle {
        let (host, port) = endpoint_of(target);
        let limit = self.lookup_timeout;
        let is_http = target.kind == TargetKind::Http;
        let is_tls = match target.kind {
            TargetKind::Http => target.address.starts_with("https://"),
            _ => port == 443,
        };

        let dns = bounded(limit, self.lookups.dns.resolve(&host));
        let trace = bounded(limit, self.lookups.tracer.trace(&host));
        let http = async {
            if is_http {
                let url = crate::probe::normalize_url(&target.address);
                bounded(limit, self.lookups.http.time(&url)).await
            } else {
                Err(LookupError::NotApplicable(format!("{} target", target.kind)))
            }
        };
        let tls = async {
            if is_tls {
                bounded(limit, self.lookups.tls.inspect(&host, port)).await
            } else {
                Err(LookupError::NotApplicable("target does not use TLS".to_string()))
            }
        };
        let (dns, trace, http, tls) = tokio::join!(dns, trace, http, tls);

        let address = match &dns {
            Ok(result) => result.addresses().into_iter().next(),
            Err(_) => host.parse::<IpAddr>().ok(),
        };
        let geo = match address {
            Some(ip) => bounded(limit, self.lookups.geo.lookup(ip)).await,
            None => Err(LookupError::Failed("no address resolved".to_string())),
        };

        DiagnosticBundle {
            incident_id: incident.id,
            vantage: vantage.to_string(),
            collected_at: Utc::now(),
            dns: Section::from_result(dns),
            trace: Section::from_result(trace),
            http_timing: Section::from_result(http),
            tls: Section::from_result(tls),
            geo: Section::from_result(geo),
        }
    }

    /// Collect and persist. Persistence failures are logged and swallowed.
    pub async fn collect_and_store(&self, incident: &Incident, target: &Target, vantage: &str) {
        let bundle = self.collect(incident, target, vantage).await;
        match self.store.add_diagnostic_bundle(&bundle) {
            Ok(()) => tracing::info!(
                incident_id = incident.id,
                vantage,
                "Stored diagnostic bundle for {}",
                target.name
            ),
            Err(e) => tracing::warn!(
                incident_id = incident.id,
                vantage,
                "Failed to store diagnostic bundle: {}",
                e
            ),
        }
    }
}

/// Unit of diagnostics work.
#[derive(Debug, Clone)]
pub struct DiagnosticTask {
    pub incident: Incident,
    pub target: Target,
    pub vantage: String,
}

/// Where the incident lifecycle submits diagnostics work.
pub trait DiagnosticsScheduler: Send + Sync {
    /// Queue work for at most `MAX_VANTAGES_PER_INCIDENT` vantage points.
    /// Returns how many tasks were accepted. Never waits.
    fn schedule(&self, incident: &Incident, target: &Target, vantages: &[String]) -> usize;
}

/// Bounded background worker pool running `DiagnosticsCollector`.
pub struct DiagnosticsPool {
    tx: mpsc::Sender<DiagnosticTask>,
    scheduled: AtomicUsize,
}

impl DiagnosticsPool {
    /// Start `workers` workers over a queue of `queue` tasks. Workers exit on `stop`
    /// or once the pool is dropped; each task is bounded by `task_timeout`.
    pub fn start(
        collector: Arc<DiagnosticsCollector>,
        workers: usize,
        queue: usize,
        task_timeout: Duration,
        stop: &broadcast::Sender<()>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<DiagnosticTask>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let collector = collector.clone();
                let mut stop_rx = stop.subscribe();
                tokio::spawn(async move {
                    loop {
                        let task = tokio::select! {
                            _ = stop_rx.recv() => break,
                            task = async { rx.lock().await.recv().await } => task,
                        };
                        let Some(task) = task else { break };

                        let work = collector.collect_and_store(&task.incident, &task.target, &task.vantage);
                        if tokio::time::timeout(task_timeout, work).await.is_err() {
                            tracing::warn!(
                                worker,
                                incident_id = task.incident.id,
                                vantage = %task.vantage,
                                "Diagnostics abandoned after {:?}",
                                task_timeout
                            );
                        }
                    }
                    tracing::debug!(worker, "Diagnostics worker stopped");
                })
            })
            .collect();

        (
            Self {
                tx,
                scheduled: AtomicUsize::new(0),
            },
            handles,
        )
    }

    /// Total tasks accepted since start.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::Relaxed)
    }
}

impl DiagnosticsScheduler for DiagnosticsPool {
    fn schedule(&self, incident: &Incident, target: &Target, vantages: &[String]) -> usize {
        let mut accepted = 0;
        for vantage in vantages.iter().take(MAX_VANTAGES_PER_INCIDENT) {
            let task = DiagnosticTask {
                incident: incident.clone(),
                target: target.clone(),
                vantage: vantage.clone(),
            };
            match self.tx.try_send(task) {
                Ok(()) => accepted += 1,
                Err(e) => tracing::warn!(
                    incident_id = incident.id,
                    vantage = %vantage,
                    "Diagnostics queue rejected task: {}",
                    e
                ),
            }
        }
        self.scheduled.fetch_add(accepted, Ordering::Relaxed);
        accepted
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Store;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records scheduled work without running it.
    #[derive(Default)]
    pub(crate) struct RecordingScheduler {
        pub tasks: StdMutex<Vec<(i64, String)>>,
    }

    impl DiagnosticsScheduler for RecordingScheduler {
        fn schedule(&self, incident: &Incident, _target: &Target, vantages: &[String]) -> usize {
            let mut tasks = self.tasks.lock().unwrap();
            for v in vantages.iter().take(MAX_VANTAGES_PER_INCIDENT) {
                tasks.push((incident.id, v.clone()));
            }
            vantages.len().min(MAX_VANTAGES_PER_INCIDENT)
        }
    }

    struct FakeDns;
    #[async_trait]
    impl DnsResolver for FakeDns {
        async fn resolve(&self, _host: &str) -> Result<DnsResult, LookupError> {
            Ok(DnsResult {
                resolver: "fake".to_string(),
                query_ms: 1.0,
                records: vec![DnsRecord {
                    record_type: "A".to_string(),
                    value: "203.0.113.7".to_string(),
                    ttl: 60,
                }],
            })
        }
    }

    struct BrokenTracer;
    #[async_trait]
    impl PathTracer for BrokenTracer {
        async fn trace(&self, _host: &str) -> Result<TraceResult, LookupError> {
            Err(LookupError::Failed("traceroute unavailable".to_string()))
        }
    }

    struct HangingTimer;
    #[async_trait]
    impl HttpTimer for HangingTimer {
        async fn time(&self, _url: &str) -> Result<HttpTiming, LookupError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(LookupError::Failed("unreachable".to_string()))
        }
    }

    struct FakeTls;
    #[async_trait]
    impl TlsInspector for FakeTls {
        async fn inspect(&self, host: &str, _port: u16) -> Result<TlsDetail, LookupError> {
            Ok(TlsDetail {
                subject: format!("CN={}", host),
                issuer: "CN=Test CA".to_string(),
                sans: vec![host.to_string()],
                not_before: Utc::now(),
                not_after: Utc::now(),
                days_remaining: 0,
                valid: true,
            })
        }
    }

    struct FakeGeo;
    #[async_trait]
    impl GeoLookup for FakeGeo {
        async fn lookup(&self, ip: IpAddr) -> Result<GeoDetail, LookupError> {
            Ok(GeoDetail {
                ip: ip.to_string(),
                country: Some("NL".to_string()),
                city: None,
                isp: None,
                org: Some("Fastly".to_string()),
                asn: None,
                cdn: classify_cdn("Fastly"),
            })
        }
    }

    fn fake_lookups() -> Lookups {
        Lookups {
            dns: Arc::new(FakeDns),
            tracer: Arc::new(BrokenTracer),
            http: Arc::new(HangingTimer),
            tls: Arc::new(FakeTls),
            geo: Arc::new(FakeGeo),
        }
    }

    fn incident(id: i64, target_id: i64) -> Incident {
        Incident {
            id,
            target_id,
            started_at: Utc::now(),
            ended_at: None,
            resolved: false,
            cause: "HTTP 503".to_string(),
            resolution_method: None,
            duration_minutes: None,
        }
    }

    fn store_with_target() -> (Arc<Store>, Target, Incident) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut target = Target {
            name: "shop".to_string(),
            kind: TargetKind::Http,
            address: "https://shop.example.com/health".to_string(),
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let incident = store
            .create_incident(target.id, Utc::now(), "HTTP 503")
            .unwrap();
        (store, target, incident)
    }

    #[test]
    fn test_endpoint_of() {
        let mut target = Target {
            kind: TargetKind::Http,
            address: "https://example.com:8443/x".to_string(),
            ..Default::default()
        };
        assert_eq!(endpoint_of(&target), ("example.com".to_string(), 8443));
        target.address = "http://example.com/".to_string();
        assert_eq!(endpoint_of(&target), ("example.com".to_string(), 80));
        target.kind = TargetKind::TcpPort;
        target.address = "db.internal".to_string();
        target.port = Some(5432);
        assert_eq!(endpoint_of(&target), ("db.internal".to_string(), 5432));
        target.address = "[2001:db8::1]:22".to_string();
        assert_eq!(endpoint_of(&target), ("2001:db8::1".to_string(), 22));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failures_do_not_abort_bundle() {
        let (store, target, incident) = store_with_target();
        let collector = DiagnosticsCollector::new(fake_lookups(), store, Duration::from_secs(5));

        let bundle = collector.collect(&incident, &target, "eu-west").await;
        assert_eq!(bundle.incident_id, incident.id);
        assert_eq!(bundle.vantage, "eu-west");
        assert!(bundle.dns.ok().is_some());
        assert_eq!(
            bundle.trace,
            Section::Failed {
                error: "traceroute unavailable".to_string()
            }
        );
        assert!(bundle.http_timing.is_failed());
        assert_eq!(bundle.tls.ok().unwrap().subject, "CN=shop.example.com");
        assert_eq!(bundle.geo.ok().unwrap().cdn.as_deref(), Some("Fastly"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_http_sections_are_skipped() {
        let (store, _, incident) = store_with_target();
        let target = Target {
            kind: TargetKind::TcpPort,
            address: "db.internal".to_string(),
            port: Some(5432),
            ..Default::default()
        };
        let collector = DiagnosticsCollector::new(fake_lookups(), store, Duration::from_secs(5));
        let bundle = collector.collect(&incident, &target, "local").await;
        assert!(matches!(bundle.http_timing, Section::Skipped { .. }));
        assert!(matches!(bundle.tls, Section::Skipped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_and_store_persists_bundle() {
        let (store, target, incident) = store_with_target();
        let collector =
            DiagnosticsCollector::new(fake_lookups(), store.clone(), Duration::from_secs(5));
        collector.collect_and_store(&incident, &target, "local").await;

        let bundles = store.get_diagnostic_bundles(incident.id).unwrap();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].trace.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_swallowed() {
        let (store, target, _) = store_with_target();
        let collector =
            DiagnosticsCollector::new(fake_lookups(), store.clone(), Duration::from_secs(5));
        // No such incident: the foreign key rejects the insert.
        collector.collect_and_store(&incident(9999, target.id), &target, "local").await;
        assert!(store.get_diagnostic_bundles(9999).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_caps_vantages_and_runs_tasks() {
        let (store, target, incident) = store_with_target();
        let collector = Arc::new(DiagnosticsCollector::new(
            fake_lookups(),
            store.clone(),
            Duration::from_secs(5),
        ));
        let (stop_tx, _) = broadcast::channel(1);
        let (pool, handles) =
            DiagnosticsPool::start(collector, 2, 16, Duration::from_secs(30), &stop_tx);

        let vantages: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(pool.schedule(&incident, &target, &vantages), 2);
        assert_eq!(pool.scheduled_count(), 2);

        for _ in 0..100 {
            if store.get_diagnostic_bundles(incident.id).unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let stored: Vec<String> = store
            .get_diagnostic_bundles(incident.id)
            .unwrap()
            .into_iter()
            .map(|b| b.vantage)
            .collect();
        assert_eq!(stored.len(), 2);
        assert!(stored.contains(&"a".to_string()) && stored.contains(&"b".to_string()));

        stop_tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let (store, target, incident) = store_with_target();
        let collector = Arc::new(DiagnosticsCollector::new(
            fake_lookups(),
            store,
            Duration::from_secs(5),
        ));
        let (stop_tx, _) = broadcast::channel(1);
        // Stop immediately so nothing drains the queue.
        let (pool, handles) =
            DiagnosticsPool::start(collector, 1, 1, Duration::from_secs(30), &stop_tx);
        stop_tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let vantages = vec!["a".to_string(), "b".to_string()];
        assert!(pool.schedule(&incident, &target, &vantages) <= 1);
    }
}
