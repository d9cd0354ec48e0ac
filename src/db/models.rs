//! Database model types.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a target is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "tcp-port")]
    TcpPort,
    #[serde(rename = "reachability")]
    Reachability,
    /// Push-style target: never probed, watched for missing signals.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::TcpPort => "tcp-port",
            TargetKind::Reachability => "reachability",
            TargetKind::Heartbeat => "heartbeat",
        }
    }

    /// Whether the kind is checked by active probing.
    pub fn is_probed(&self) -> bool {
        !matches!(self, TargetKind::Heartbeat)
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TargetKind::Http),
            "tcp-port" => Ok(TargetKind::TcpPort),
            "reachability" => Ok(TargetKind::Reachability),
            "heartbeat" => Ok(TargetKind::Heartbeat),
            other => Err(format!("unknown target kind: {}", other)),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Up => "up",
            TargetStatus::Down => "down",
            TargetStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(TargetStatus::Up),
            "down" => Ok(TargetStatus::Down),
            "unknown" => Ok(TargetStatus::Unknown),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication attached to HTTP probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProbeAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Per-target notification destinations. An absent channel is never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

/// A monitored entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub kind: TargetKind,
    /// URL for http targets, host for tcp-port and reachability targets.
    pub address: String,
    pub port: Option<u16>,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub auth: ProbeAuth,
    /// Polling interval in seconds
    pub interval_secs: u64,
    pub status: TargetStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_status_code: Option<u16>,
    /// Expected seconds between heartbeat signals
    pub heartbeat_interval_secs: Option<u64>,
    pub last_signal_at: Option<DateTime<Utc>>,
    pub channels: ChannelConfig,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: TargetKind::Http,
            address: String::new(),
            port: None,
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            auth: ProbeAuth::None,
            interval_secs: 300,
            status: TargetStatus::Unknown,
            last_checked_at: None,
            last_latency_ms: None,
            last_status_code: None,
            heartbeat_interval_secs: None,
            last_signal_at: None,
            channels: ChannelConfig::default(),
        }
    }
}

/// Classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeClass {
    Up,
    Down,
    Timeout,
    Error,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Up => "up",
            OutcomeClass::Down => "down",
            OutcomeClass::Timeout => "timeout",
            OutcomeClass::Error => "error",
        }
    }

    /// Down, timeout and error all count against the target.
    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeClass::Up)
    }
}

impl FromStr for OutcomeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(OutcomeClass::Up),
            "down" => Ok(OutcomeClass::Down),
            "timeout" => Ok(OutcomeClass::Timeout),
            "error" => Ok(OutcomeClass::Error),
            other => Err(format!("unknown outcome class: {}", other)),
        }
    }
}

/// Result of one probe from one vantage point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub vantage: String,
    pub class: OutcomeClass,
    /// Latency in milliseconds, measured up to the failure point on failure.
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn up(vantage: &str, latency_ms: f64, status_code: Option<u16>) -> Self {
        Self {
            vantage: vantage.to_string(),
            class: OutcomeClass::Up,
            latency_ms,
            status_code,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        vantage: &str,
        class: OutcomeClass,
        latency_ms: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            vantage: vantage.to_string(),
            class,
            latency_ms,
            status_code: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// How an incident was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    Probe,
    Heartbeat,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::Probe => "probe",
            ResolutionMethod::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for ResolutionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(ResolutionMethod::Probe),
            "heartbeat" => Ok(ResolutionMethod::Heartbeat),
            other => Err(format!("unknown resolution method: {}", other)),
        }
    }
}

/// One continuous down period for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub target_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub cause: String,
    pub resolution_method: Option<ResolutionMethod>,
    /// Whole minutes, set on close
    pub duration_minutes: Option<i64>,
}

/// Status fields written after every verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusUpdate {
    pub status: TargetStatus,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
}

/// One consolidated check: a consensus round, a heartbeat signal or a watchdog verdict.
///
/// This is the history the SLA engine reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub target_id: i64,
    pub checked_at: DateTime<Utc>,
    pub status: TargetStatus,
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl CheckRecord {
    pub fn is_up(&self) -> bool {
        self.status == TargetStatus::Up
    }
}

/// A received "I'm alive" signal for a heartbeat target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSignal {
    pub target_id: i64,
    pub received_at: DateTime<Utc>,
    pub status: Option<String>,
    pub latency_ms: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}
