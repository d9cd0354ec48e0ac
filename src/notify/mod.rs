//! Notification fan-out.
//!
//! One `NotificationEvent` is dispatched to every channel configured on a
//! target, concurrently and in isolation: a failing, hanging or panicking
//! adapter only ever affects its own entry in the `DispatchReport`.

mod adapters;

pub use adapters::*;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::ExpiringStore;
use crate::consensus::ConsensusVerdict;
use crate::db::{ChannelConfig, Target};
use crate::sla::SlaCalculation;

/// Notification errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("{channel} returned status {status}")]
    Status { channel: Channel, status: u16 },
    #[error("no {0} adapter configured")]
    NotConfigured(Channel),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("test notifications are rate limited; retry within {retry_within:?}")]
    RateLimited { retry_within: Duration },
}

/// Delivery channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Slack,
    Discord,
    Sms,
    Webhook,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Slack,
        Channel::Discord,
        Channel::Sms,
        Channel::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Slack => "slack",
            Channel::Discord => "discord",
            Channel::Sms => "sms",
            Channel::Webhook => "webhook",
        }
    }

    /// Destination configured for this channel, if any.
    pub fn destination<'a>(&self, config: &'a ChannelConfig) -> Option<&'a str> {
        let value = match self {
            Channel::Email => &config.email,
            Channel::Slack => &config.slack,
            Channel::Discord => &config.discord,
            Channel::Sms => &config.sms,
            Channel::Webhook => &config.webhook,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every configured (channel, destination) pair, in channel order.
pub fn configured_channels(config: &ChannelConfig) -> Vec<(Channel, String)> {
    Channel::ALL
        .iter()
        .filter_map(|c| c.destination(config).map(|d| (*c, d.to_string())))
        .collect()
}

/// What happened to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Down,
    Up,
    Test,
    SlaBreach,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Down => "DOWN",
            EventKind::Up => "RECOVERED",
            EventKind::Test => "TEST",
            EventKind::SlaBreach => "SLA BREACH",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            EventKind::Down => "🔴",
            EventKind::Up => "🟢",
            EventKind::Test => "🧪",
            EventKind::SlaBreach => "⚠️",
        }
    }

    /// RGB colour used by chat channels.
    pub fn color(&self) -> u32 {
        match self {
            EventKind::Down => 0xE5_3E_3E,
            EventKind::Up => 0x38_A1_69,
            EventKind::Test => 0x31_82_CE,
            EventKind::SlaBreach => 0xDD_6B_20,
        }
    }
}

/// Payload describing a status change, sent unchanged to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub target_name: String,
    pub target_url: String,
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub downtime_minutes: Option<i64>,
    /// Extra context, e.g. the SLA label for breaches.
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    fn base(kind: EventKind, target: &Target, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            target_name: target.name.clone(),
            target_url: target.address.clone(),
            latency_ms: None,
            status_code: None,
            error: None,
            downtime_minutes: None,
            detail: None,
            timestamp,
        }
    }

    pub fn down(target: &Target, verdict: &ConsensusVerdict) -> Self {
        Self {
            status_code: verdict.status_code,
            error: Some(verdict.cause()),
            ..Self::base(EventKind::Down, target, verdict.timestamp)
        }
    }

    pub fn up(target: &Target, verdict: &ConsensusVerdict, downtime_minutes: Option<i64>) -> Self {
        Self {
            latency_ms: verdict.mean_latency_ms,
            status_code: verdict.status_code,
            downtime_minutes,
            ..Self::base(EventKind::Up, target, verdict.timestamp)
        }
    }

    pub fn test(target: &Target) -> Self {
        Self {
            detail: Some("This is a test notification.".to_string()),
            ..Self::base(EventKind::Test, target, Utc::now())
        }
    }

    pub fn sla_breach(target: &Target, calc: &SlaCalculation) -> Self {
        let detail = match calc.actual_uptime {
            Some(actual) => format!(
                "{}: actual uptime {:.3}% below target {:.3}% ({:.1} min over budget)",
                calc.label,
                actual * 100.0,
                calc.target_uptime * 100.0,
                -calc.remaining_budget_minutes.unwrap_or(0.0)
            ),
            None => format!("{}: breached", calc.label),
        };
        Self {
            detail: Some(detail),
            ..Self::base(EventKind::SlaBreach, target, Utc::now())
        }
    }

    /// One-line headline, e.g. `🔴 DOWN: api.example.com`.
    pub fn title(&self) -> String {
        format!("{} {}: {}", self.kind.emoji(), self.kind.label(), self.target_name)
    }

    /// Plain-text body shared by email and SMS.
    pub fn summary(&self) -> String {
        let mut lines = vec![self.title(), format!("URL: {}", self.target_url)];
        if let Some(code) = self.status_code {
            lines.push(format!("Status code: {}", code));
        }
        if let Some(latency) = self.latency_ms {
            lines.push(format!("Response time: {:.0} ms", latency));
        }
        if let Some(error) = &self.error {
            lines.push(format!("Error: {}", error));
        }
        if let Some(minutes) = self.downtime_minutes {
            lines.push(format!("Downtime: {} min", minutes));
        }
        if let Some(detail) = &self.detail {
            lines.push(detail.clone());
        }
        lines.push(format!("Time: {}", self.timestamp.to_rfc3339()));
        lines.join("\n")
    }
}

/// Result of one channel attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Aggregate of one fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// True iff at least one channel succeeded.
    pub overall_success: bool,
    pub per_channel: BTreeMap<Channel, ChannelResult>,
}

/// Sends one event to one destination of a given channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Key of the test-notification rate limit: (caller identity, target id).
pub type TestKey = (String, i64);

/// Fans events out to channel adapters.
pub struct NotificationFanout {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    channel_timeout: Duration,
    test_limiter: Arc<dyn ExpiringStore<TestKey, ()>>,
}

impl NotificationFanout {
    pub fn new(
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        channel_timeout: Duration,
        test_limiter: Arc<dyn ExpiringStore<TestKey, ()>>,
    ) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.channel(), a)).collect(),
            channel_timeout,
            test_limiter,
        }
    }

    /// Send `event` to every channel configured on the target.
    pub async fn dispatch(&self, target: &Target, event: &NotificationEvent) -> DispatchReport {
        let report = self
            .dispatch_to(configured_channels(&target.channels), event)
            .await;
        log_report(target, event, &report);
        report
    }

    /// Test-mode dispatch with an explicit enable map, rate limited per caller and target.
    ///
    /// Destinations come from `channels` (unsaved configuration), falling back to
    /// the target's stored destination for the same channel.
    pub async fn dispatch_test(
        &self,
        caller: &str,
        target: &Target,
        channels: &ChannelConfig,
        enabled: &HashMap<Channel, bool>,
    ) -> Result<DispatchReport, NotifyError> {
        if !self.test_limiter.claim((caller.to_string(), target.id), ()) {
            tracing::info!(caller, target_id = target.id, "test notification rate limited");
            return Err(NotifyError::RateLimited {
                retry_within: self.test_limiter.ttl(),
            });
        }

        let destinations: Vec<(Channel, String)> = Channel::ALL
            .iter()
            .filter(|c| enabled.get(*c).copied().unwrap_or(false))
            .filter_map(|c| {
                c.destination(channels)
                    .or_else(|| c.destination(&target.channels))
                    .map(|d| (*c, d.to_string()))
            })
            .collect();

        let event = NotificationEvent::test(target);
        let report = self.dispatch_to(destinations, &event).await;
        log_report(target, &event, &report);
        Ok(report)
    }

    /// Run every (channel, destination) concurrently with its own deadline.
    pub async fn dispatch_to(
        &self,
        destinations: Vec<(Channel, String)>,
        event: &NotificationEvent,
    ) -> DispatchReport {
        let mut pending = Vec::with_capacity(destinations.len());
        let mut per_channel = BTreeMap::new();

        for (channel, destination) in destinations {
            let Some(adapter) = self.adapters.get(&channel).cloned() else {
                per_channel.insert(
                    channel,
                    ChannelResult::failed(NotifyError::NotConfigured(channel).to_string()),
                );
                continue;
            };

            let event = event.clone();
            let timeout = self.channel_timeout;
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, adapter.send(&destination, &event)).await {
                    Ok(result) => result,
                    Err(_) => Err(NotifyError::Timeout(timeout)),
                }
            });
            pending.push((channel, handle));
        }

        let channels: Vec<Channel> = pending.iter().map(|(c, _)| *c).collect();
        let results = futures::future::join_all(pending.into_iter().map(|(_, h)| h)).await;

        for (channel, joined) in channels.into_iter().zip(results) {
            let result = match joined {
                Ok(Ok(())) => ChannelResult::ok(),
                Ok(Err(e)) => ChannelResult::failed(e.to_string()),
                Err(e) => ChannelResult::failed(format!("{} adapter crashed: {}", channel, e)),
            };
            per_channel.insert(channel, result);
        }

        let overall_success = per_channel.values().any(|r| r.success);
        DispatchReport {
            overall_success,
            per_channel,
        }
    }
}

fn log_report(target: &Target, event: &NotificationEvent, report: &DispatchReport) {
    for (channel, result) in &report.per_channel {
        if let Some(error) = &result.error {
            tracing::warn!(
                target_id = target.id,
                channel = %channel,
                kind = ?event.kind,
                "notification failed: {}",
                error
            );
        }
    }
    tracing::info!(
        target_id = target.id,
        kind = ?event.kind,
        channels = report.per_channel.len(),
        success = report.overall_success,
        "notification dispatched"
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    pub(crate) enum Behavior {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    /// Adapter with scripted behaviour that records what it was asked to send.
    pub(crate) struct FakeAdapter {
        pub channel: Channel,
        pub behavior: Behavior,
        pub sent: Mutex<Vec<(String, EventKind)>>,
    }

    impl FakeAdapter {
        pub(crate) fn new(channel: Channel, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                channel,
                behavior,
                sent: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn sent(&self) -> Vec<(String, EventKind)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for FakeAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), event.kind));
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(NotifyError::Http("gateway exploded".to_string())),
                Behavior::Panic => panic!("adapter bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn fanout(adapters: Vec<Arc<dyn ChannelAdapter>>) -> NotificationFanout {
        NotificationFanout::new(
            adapters,
            Duration::from_secs(10),
            Arc::new(MemoryStore::new(Duration::from_secs(3600))),
        )
    }

    fn target_with(channels: ChannelConfig) -> Target {
        Target {
            id: 7,
            name: "api".to_string(),
            address: "https://api.example.com".to_string(),
            channels,
            ..Default::default()
        }
    }

    fn three_channels() -> ChannelConfig {
        ChannelConfig {
            email: Some("ops@example.com".to_string()),
            slack: Some("https://hooks.slack.test/x".to_string()),
            webhook: Some("https://hooks.example.com/y".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_fail_the_rest() {
        let email = FakeAdapter::new(Channel::Email, Behavior::Succeed);
        let slack = FakeAdapter::new(Channel::Slack, Behavior::Fail);
        let webhook = FakeAdapter::new(Channel::Webhook, Behavior::Succeed);
        let fanout = fanout(vec![email.clone(), slack.clone(), webhook.clone()]);

        let target = target_with(three_channels());
        let report = fanout
            .dispatch(&target, &NotificationEvent::test(&target))
            .await;

        assert!(report.overall_success);
        assert_eq!(report.per_channel.len(), 3);
        assert_eq!(report.per_channel[&Channel::Email], ChannelResult::ok());
        assert_eq!(report.per_channel[&Channel::Webhook], ChannelResult::ok());
        let failed = &report.per_channel[&Channel::Slack];
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap().contains("gateway exploded"));
        assert_eq!(email.sent()[0].0, "ops@example.com");
    }

    #[tokio::test]
    async fn test_panicking_channel_is_isolated() {
        let fanout = fanout(vec![
            FakeAdapter::new(Channel::Email, Behavior::Panic),
            FakeAdapter::new(Channel::Slack, Behavior::Succeed),
        ]);
        let target = target_with(three_channels());
        let report = fanout
            .dispatch(&target, &NotificationEvent::test(&target))
            .await;

        assert!(report.overall_success);
        assert!(!report.per_channel[&Channel::Email].success);
        assert!(report.per_channel[&Channel::Slack].success);
        // Webhook is configured on the target but has no adapter.
        assert!(!report.per_channel[&Channel::Webhook].success);
    }

    #[tokio::test]
    async fn test_no_configured_channels() {
        let fanout = fanout(vec![FakeAdapter::new(Channel::Email, Behavior::Succeed)]);
        let target = target_with(ChannelConfig::default());
        let report = fanout
            .dispatch(&target, &NotificationEvent::test(&target))
            .await;
        assert!(!report.overall_success);
        assert!(report.per_channel.is_empty());
    }

    #[tokio::test]
    async fn test_all_channels_failing() {
        let fanout = fanout(vec![
            FakeAdapter::new(Channel::Email, Behavior::Fail),
            FakeAdapter::new(Channel::Slack, Behavior::Fail),
            FakeAdapter::new(Channel::Webhook, Behavior::Fail),
        ]);
        let target = target_with(three_channels());
        let report = fanout
            .dispatch(&target, &NotificationEvent::test(&target))
            .await;
        assert!(!report.overall_success);
        assert_eq!(report.per_channel.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_channel_times_out_independently() {
        let fanout = fanout(vec![
            FakeAdapter::new(Channel::Email, Behavior::Hang),
            FakeAdapter::new(Channel::Slack, Behavior::Succeed),
        ]);
        let target = target_with(ChannelConfig {
            email: Some("ops@example.com".to_string()),
            slack: Some("https://hooks.slack.test/x".to_string()),
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        let report = fanout
            .dispatch(&target, &NotificationEvent::test(&target))
            .await;
        assert!(start.elapsed() < Duration::from_secs(11));
        assert!(report.overall_success);
        let email = &report.per_channel[&Channel::Email];
        assert!(email.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_blank_destination_is_not_configured() {
        let config = ChannelConfig {
            sms: Some("  ".to_string()),
            discord: Some("https://discord.test/hook".to_string()),
            ..Default::default()
        };
        let channels = configured_channels(&config);
        assert_eq!(channels, vec![(Channel::Discord, "https://discord.test/hook".to_string())]);
    }

    #[tokio::test]
    async fn test_dispatch_test_uses_enable_map_and_rate_limits() {
        let email = FakeAdapter::new(Channel::Email, Behavior::Succeed);
        let slack = FakeAdapter::new(Channel::Slack, Behavior::Succeed);
        let fanout = fanout(vec![email.clone(), slack.clone()]);

        // Stored config has slack only; the caller tests an unsaved email address.
        let target = target_with(ChannelConfig {
            slack: Some("https://hooks.slack.test/stored".to_string()),
            ..Default::default()
        });
        let unsaved = ChannelConfig {
            email: Some("new@example.com".to_string()),
            ..Default::default()
        };
        let enabled = HashMap::from([(Channel::Email, true), (Channel::Slack, false)]);

        let report = fanout
            .dispatch_test("alice", &target, &unsaved, &enabled)
            .await
            .unwrap();
        assert!(report.overall_success);
        assert_eq!(report.per_channel.len(), 1);
        assert_eq!(email.sent(), vec![("new@example.com".to_string(), EventKind::Test)]);
        assert!(slack.sent().is_empty());

        let again = fanout.dispatch_test("alice", &target, &unsaved, &enabled).await;
        assert!(matches!(again, Err(NotifyError::RateLimited { .. })));

        // Another caller has its own budget.
        assert!(fanout.dispatch_test("bob", &target, &unsaved, &enabled).await.is_ok());
    }

    #[test]
    fn test_event_styling() {
        let target = target_with(ChannelConfig::default());
        let event = NotificationEvent::test(&target);
        assert_eq!(event.title(), "🧪 TEST: api");
        assert!(event.summary().contains("URL: https://api.example.com"));
        assert_ne!(EventKind::Down.color(), EventKind::Up.color());
    }
}
