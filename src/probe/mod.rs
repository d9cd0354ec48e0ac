//! Probe module for target health checks.
//!
//! Supports HTTP, TCP port and reachability probes, run either from this
//! process or from a remote vantage-point agent. Every failure is folded into
//! a `ProbeOutcome`; nothing escapes `ProbeExecutor::probe` as an error.

mod http;
mod ping;
mod remote;
mod tcp;

pub use http::*;
pub use ping::*;
pub use remote::*;
pub use tcp::*;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{OutcomeClass, ProbeOutcome, Target, TargetKind};

/// Header naming the vantage point a probe originates from.
pub const VANTAGE_HEADER: &str = "X-Vantage-Point";

/// User agent sent with every HTTP probe.
pub const USER_AGENT: &str = concat!("vantage-monitor/", env!("CARGO_PKG_VERSION"));

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProbeError {
    /// Outcome class a failure is reported as.
    pub fn class(&self) -> OutcomeClass {
        match self {
            ProbeError::Timeout(_) => OutcomeClass::Timeout,
            ProbeError::Refused(_) | ProbeError::HttpStatus(_) => OutcomeClass::Down,
            ProbeError::Dns(_)
            | ProbeError::Tls(_)
            | ProbeError::Network(_)
            | ProbeError::Config(_) => OutcomeClass::Error,
        }
    }
}

/// One origin from which probes are issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VantagePoint {
    pub id: String,
    /// Base URL of a remote agent; `None` probes from this process.
    pub endpoint: Option<String>,
}

impl VantagePoint {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: None,
        }
    }

    pub fn remote(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: Some(endpoint.into()),
        }
    }
}

/// What a successful probe observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: Option<u16>,
}

/// One way of probing a target, selected by `TargetKind`.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    async fn run(
        &self,
        target: &Target,
        vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError>;
}

/// Anything that can produce a `ProbeOutcome` for a target from a vantage point.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target, vantage: &VantagePoint, timeout: Duration) -> ProbeOutcome;
}

/// Runs single probes and normalises every result into a `ProbeOutcome`.
pub struct ProbeExecutor {
    http: HttpProbe,
    tcp: TcpProbe,
    reachability: ReachabilityProbe,
    remote: RemoteProbe,
    jitter: bool,
}

impl ProbeExecutor {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            http: HttpProbe::new()?,
            tcp: TcpProbe,
            reachability: ReachabilityProbe::default(),
            remote: RemoteProbe::new()?,
            jitter: true,
        })
    }

    /// Disable the start-up jitter (tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn strategy(&self, kind: TargetKind) -> Option<&dyn ProbeStrategy> {
        match kind {
            TargetKind::Http => Some(&self.http),
            TargetKind::TcpPort => Some(&self.tcp),
            TargetKind::Reachability => Some(&self.reachability),
            TargetKind::Heartbeat => None,
        }
    }

    /// Probe from this process, ignoring any remote endpoint on the vantage point.
    pub async fn probe_local(
        &self,
        target: &Target,
        vantage: &VantagePoint,
        timeout: Duration,
    ) -> ProbeOutcome {
        let Some(strategy) = self.strategy(target.kind) else {
            return ProbeOutcome::failed(
                &vantage.id,
                OutcomeClass::Error,
                0.0,
                format!("{} targets are not probed", target.kind),
            );
        };

        // Add jitter to avoid thundering herd
        if self.jitter {
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, strategy.run(target, vantage, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        to_outcome(&vantage.id, result, latency_ms)
    }
}

#[async_trait]
impl Prober for ProbeExecutor {
    async fn probe(&self, target: &Target, vantage: &VantagePoint, timeout: Duration) -> ProbeOutcome {
        if target.kind.is_probed() && vantage.endpoint.is_some() {
            let start = Instant::now();
            return match self.remote.run(target, vantage, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(vantage = %vantage.id, target_id = target.id, "remote probe failed: {}", e);
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    ProbeOutcome::failed(&vantage.id, OutcomeClass::Error, latency_ms, e.to_string())
                }
            };
        }

        self.probe_local(target, vantage, timeout).await
    }
}

/// Map a strategy result onto an outcome.
pub fn to_outcome(
    vantage: &str,
    result: Result<ProbeResponse, ProbeError>,
    latency_ms: f64,
) -> ProbeOutcome {
    match result {
        Ok(resp) => ProbeOutcome {
            vantage: vantage.to_string(),
            class: OutcomeClass::Up,
            latency_ms,
            status_code: resp.status_code,
            error: None,
            timestamp: Utc::now(),
        },
        Err(ProbeError::HttpStatus(code)) => {
            ProbeOutcome::failed(vantage, OutcomeClass::Down, latency_ms, format!("HTTP {}", code))
                .with_status_code(code)
        }
        Err(e) => ProbeOutcome::failed(vantage, e.class(), latency_ms, e.to_string()),
    }
}
