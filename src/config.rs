//! Configuration module for Vantage.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::probe::VantagePoint;

/// Credentials for the HTTP email gateway used by the email channel.
#[derive(Debug, Clone)]
pub struct EmailGatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

/// Credentials for the SMS gateway used by the sms channel.
#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub api_url: String,
    pub account: String,
    pub token: String,
    pub from: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "vantage.db")
    pub db_path: String,
    /// Cadence of the consensus and heartbeat sweeps (default: 5 minutes)
    pub sweep_interval: Duration,
    /// Cadence of the SLA breach sweep (default: 1 hour)
    pub sla_sweep_interval: Duration,
    /// Shared deadline for one consensus round (default: 15s)
    pub probe_timeout: Duration,
    /// Deadline for a single channel send (default: 10s)
    pub channel_timeout: Duration,
    /// Targets processed concurrently per sweep batch (default: 5)
    pub batch_size: usize,
    /// Pause between sweep batches (default: 1s)
    pub batch_pause: Duration,
    /// Cool-down between test notifications per caller and target (default: 60 minutes)
    pub test_cooldown: Duration,
    /// Vantage points probed on every consensus round
    pub vantage_points: Vec<VantagePoint>,
    /// Size of the diagnostics worker pool (default: 4)
    pub diagnostic_workers: usize,
    pub email: Option<EmailGatewayConfig>,
    pub sms: Option<SmsGatewayConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "vantage.db".to_string(),
            sweep_interval: Duration::from_secs(300),
            sla_sweep_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(15),
            channel_timeout: Duration::from_secs(10),
            batch_size: 5,
            batch_pause: Duration::from_millis(1000),
            test_cooldown: Duration::from_secs(60 * 60),
            vantage_points: vec![VantagePoint::local("local")],
            diagnostic_workers: 4,
            email: None,
            sms: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VANTAGE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `VANTAGE_DB_PATH`: Database file path (default: "vantage.db")
    /// - `VANTAGE_SWEEP_INTERVAL_SECS`, `VANTAGE_SLA_SWEEP_INTERVAL_SECS`
    /// - `VANTAGE_PROBE_TIMEOUT_SECS`, `VANTAGE_CHANNEL_TIMEOUT_SECS`
    /// - `VANTAGE_BATCH_SIZE`, `VANTAGE_BATCH_PAUSE_MS`
    /// - `VANTAGE_TEST_COOLDOWN_MINS`
    /// - `VANTAGE_VANTAGE_POINTS`: comma list of `id` or `id=https://agent`
    /// - `VANTAGE_DIAGNOSTIC_WORKERS`
    /// - `VANTAGE_EMAIL_API_URL`, `VANTAGE_EMAIL_API_KEY`, `VANTAGE_EMAIL_FROM`
    /// - `VANTAGE_SMS_API_URL`, `VANTAGE_SMS_ACCOUNT`, `VANTAGE_SMS_TOKEN`, `VANTAGE_SMS_FROM`
    ///
    /// Values that fail to parse keep their default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("VANTAGE_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("VANTAGE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_var::<u64>("VANTAGE_SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("VANTAGE_SLA_SWEEP_INTERVAL_SECS") {
            cfg.sla_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("VANTAGE_PROBE_TIMEOUT_SECS") {
            cfg.probe_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("VANTAGE_CHANNEL_TIMEOUT_SECS") {
            cfg.channel_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = parse_var::<usize>("VANTAGE_BATCH_SIZE") {
            cfg.batch_size = size.max(1);
        }
        if let Some(ms) = parse_var::<u64>("VANTAGE_BATCH_PAUSE_MS") {
            cfg.batch_pause = Duration::from_millis(ms);
        }
        if let Some(mins) = parse_var::<u64>("VANTAGE_TEST_COOLDOWN_MINS") {
            cfg.test_cooldown = Duration::from_secs(mins * 60);
        }
        if let Ok(list) = env::var("VANTAGE_VANTAGE_POINTS") {
            let points = parse_vantage_points(&list);
            if !points.is_empty() {
                cfg.vantage_points = points;
            }
        }
        if let Some(workers) = parse_var::<usize>("VANTAGE_DIAGNOSTIC_WORKERS") {
            cfg.diagnostic_workers = workers.max(1);
        }

        if let (Ok(api_url), Ok(api_key), Ok(from)) = (
            env::var("VANTAGE_EMAIL_API_URL"),
            env::var("VANTAGE_EMAIL_API_KEY"),
            env::var("VANTAGE_EMAIL_FROM"),
        ) {
            cfg.email = Some(EmailGatewayConfig { api_url, api_key, from });
        }

        if let (Ok(api_url), Ok(account), Ok(token), Ok(from)) = (
            env::var("VANTAGE_SMS_API_URL"),
            env::var("VANTAGE_SMS_ACCOUNT"),
            env::var("VANTAGE_SMS_TOKEN"),
            env::var("VANTAGE_SMS_FROM"),
        ) {
            cfg.sms = Some(SmsGatewayConfig { api_url, account, token, from });
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, keeping default", name, raw);
            None
        }
    }
}

/// Parse `"us-east,eu-west=https://eu.agent.example"` into vantage points.
pub fn parse_vantage_points(list: &str) -> Vec<VantagePoint> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, endpoint)) => VantagePoint::remote(id.trim(), endpoint.trim()),
            None => VantagePoint::local(entry),
        })
        .collect()
}
