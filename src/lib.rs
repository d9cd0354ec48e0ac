//! Vantage - multi-location uptime monitoring.
//!
//! Probes targets from several vantage points, decides up/down by majority,
//! tracks incidents and SLAs, and fans alerts out to notification channels.

pub mod cache;
pub mod config;
pub mod consensus;
pub mod db;
pub mod diagnostics;
pub mod heartbeat;
pub mod incident;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod sla;
pub mod web;
