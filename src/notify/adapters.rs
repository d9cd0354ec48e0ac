//! HTTP-backed channel adapters.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Channel, ChannelAdapter, NotificationEvent, NotifyError};
use crate::config::{EmailGatewayConfig, ServerConfig, SmsGatewayConfig};

fn client() -> Result<reqwest::Client, NotifyError> {
    reqwest::Client::builder()
        .user_agent(crate::probe::USER_AGENT)
        .build()
        .map_err(|e| NotifyError::Http(e.to_string()))
}

async fn check_response(
    channel: Channel,
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<(), NotifyError> {
    let response = result.map_err(|e| NotifyError::Http(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NotifyError::Status {
            channel,
            status: status.as_u16(),
        })
    }
}

fn hex_color(color: u32) -> String {
    format!("#{:06x}", color)
}

fn fields(event: &NotificationEvent) -> Vec<(&'static str, String)> {
    let mut fields = vec![("URL", event.target_url.clone())];
    if let Some(code) = event.status_code {
        fields.push(("Status code", code.to_string()));
    }
    if let Some(latency) = event.latency_ms {
        fields.push(("Response time", format!("{:.0} ms", latency)));
    }
    if let Some(error) = &event.error {
        fields.push(("Error", error.clone()));
    }
    if let Some(minutes) = event.downtime_minutes {
        fields.push(("Downtime", format!("{} min", minutes)));
    }
    fields
}

/// Slack incoming-webhook payload.
pub fn slack_payload(event: &NotificationEvent) -> Value {
    let fields: Vec<Value> = fields(event)
        .into_iter()
        .map(|(title, value)| json!({ "title": title, "value": value, "short": title != "Error" }))
        .collect();
    json!({
        "text": event.title(),
        "attachments": [{
            "color": hex_color(event.kind.color()),
            "title": event.target_name,
            "title_link": event.target_url,
            "text": event.detail.clone().unwrap_or_default(),
            "fields": fields,
            "ts": event.timestamp.timestamp(),
        }]
    })
}

/// Discord webhook payload.
pub fn discord_payload(event: &NotificationEvent) -> Value {
    let fields: Vec<Value> = fields(event)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value, "inline": name != "Error" }))
        .collect();
    json!({
        "embeds": [{
            "title": event.title(),
            "description": event.detail.clone().unwrap_or_default(),
            "url": event.target_url,
            "color": event.kind.color(),
            "fields": fields,
            "timestamp": event.timestamp.to_rfc3339(),
        }]
    })
}

/// Generic webhook payload: the event itself plus a headline.
pub fn webhook_payload(event: &NotificationEvent) -> Value {
    json!({
        "event": event.kind,
        "title": event.title(),
        "target": {
            "name": event.target_name,
            "url": event.target_url,
        },
        "latency_ms": event.latency_ms,
        "status_code": event.status_code,
        "error": event.error,
        "downtime_minutes": event.downtime_minutes,
        "detail": event.detail,
        "timestamp": event.timestamp.to_rfc3339(),
    })
}

pub struct SlackAdapter {
    client: reqwest::Client,
}

impl SlackAdapter {
    pub fn new() -> Result<Self, NotifyError> {
        Ok(Self { client: client()? })
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel(&self) -> Channel {
        Channel::Slack
    }

    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        let result = self
            .client
            .post(destination)
            .json(&slack_payload(event))
            .send()
            .await;
        check_response(Channel::Slack, result).await
    }
}

pub struct DiscordAdapter {
    client: reqwest::Client,
}

impl DiscordAdapter {
    pub fn new() -> Result<Self, NotifyError> {
        Ok(Self { client: client()? })
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel(&self) -> Channel {
        Channel::Discord
    }

    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        let result = self
            .client
            .post(destination)
            .json(&discord_payload(event))
            .send()
            .await;
        check_response(Channel::Discord, result).await
    }
}

pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new() -> Result<Self, NotifyError> {
        Ok(Self { client: client()? })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        let result = self
            .client
            .post(destination)
            .json(&webhook_payload(event))
            .send()
            .await;
        check_response(Channel::Webhook, result).await
    }
}

/// Email through a JSON mail API authenticated with a bearer key.
pub struct EmailAdapter {
    client: reqwest::Client,
    config: EmailGatewayConfig,
}

impl EmailAdapter {
    pub fn new(config: EmailGatewayConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            client: client()?,
            config,
        })
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = json!({
            "from": self.config.from,
            "to": [destination],
            "subject": event.title(),
            "text": event.summary(),
        });
        let result = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await;
        check_response(Channel::Email, result).await
    }
}

/// SMS through a Twilio-style messages endpoint.
pub struct SmsAdapter {
    client: reqwest::Client,
    config: SmsGatewayConfig,
}

impl SmsAdapter {
    pub fn new(config: SmsGatewayConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            client: client()?,
            config,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_url.trim_end_matches('/'),
            self.config.account
        )
    }
}

/// SMS text: headline plus the most useful single detail, kept short.
pub fn sms_body(event: &NotificationEvent) -> String {
    let mut body = event.title();
    if let Some(error) = &event.error {
        body.push_str(&format!(" ({})", error));
    } else if let Some(minutes) = event.downtime_minutes {
        body.push_str(&format!(" after {} min", minutes));
    }
    body.chars().take(160).collect()
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, destination: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        let text = sms_body(event);
        let form = [
            ("To", destination),
            ("From", self.config.from.as_str()),
            ("Body", text.as_str()),
        ];
        let result = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account, Some(&self.config.token))
            .form(&form)
            .send()
            .await;
        check_response(Channel::Sms, result).await
    }
}

/// Build every adapter the configuration allows. Email and SMS need gateway credentials.
pub fn build_adapters(config: &ServerConfig) -> Result<Vec<Arc<dyn ChannelAdapter>>, NotifyError> {
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
        Arc::new(SlackAdapter::new()?),
        Arc::new(DiscordAdapter::new()?),
        Arc::new(WebhookAdapter::new()?),
    ];
    match &config.email {
        Some(email) => adapters.push(Arc::new(EmailAdapter::new(email.clone())?)),
        None => tracing::info!("Email gateway not configured; email notifications disabled"),
    }
    match &config.sms {
        Some(sms) => adapters.push(Arc::new(SmsAdapter::new(sms.clone())?)),
        None => tracing::info!("SMS gateway not configured; SMS notifications disabled"),
    }
    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use crate::notify::EventKind;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn down_event() -> NotificationEvent {
        let target = Target {
            name: "api".to_string(),
            address: "https://api.example.com".to_string(),
            ..Default::default()
        };
        NotificationEvent {
            kind: EventKind::Down,
            status_code: Some(503),
            error: Some("HTTP 503".to_string()),
            ..NotificationEvent::test(&target)
        }
    }

    #[test]
    fn test_slack_payload_colour_and_fields() {
        let payload = slack_payload(&down_event());
        assert_eq!(payload["text"], "🔴 DOWN: api");
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#e53e3e");
        let titles: Vec<&str> = attachment["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["URL", "Status code", "Error"]);
    }

    #[test]
    fn test_discord_payload_uses_integer_colour() {
        let payload = discord_payload(&down_event());
        assert_eq!(payload["embeds"][0]["color"], 0xE5_3E_3E);
        assert_eq!(payload["embeds"][0]["url"], "https://api.example.com");
    }

    #[test]
    fn test_webhook_payload_kind() {
        let payload = webhook_payload(&down_event());
        assert_eq!(payload["event"], "down");
        assert_eq!(payload["status_code"], 503);
    }

    #[test]
    fn test_sms_body_is_short() {
        let mut event = down_event();
        event.error = Some("x".repeat(500));
        let body = sms_body(&event);
        assert!(body.starts_with("🔴 DOWN: api ("));
        assert_eq!(body.chars().count(), 160);
    }

    #[test]
    fn test_build_adapters_without_gateways() {
        let adapters = build_adapters(&ServerConfig::default()).unwrap();
        let channels: Vec<Channel> = adapters.iter().map(|a| a.channel()).collect();
        assert_eq!(channels, vec![Channel::Slack, Channel::Discord, Channel::Webhook]);
    }

    /// Accept one request, return its raw text, answer with `status`.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                if let Some(idx) = text.find("\r\n\r\n") {
                    let length = text[..idx]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if read >= idx + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..read]).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_webhook_adapter_posts_json() {
        let (url, server) = one_shot_server(200).await;
        let adapter = WebhookAdapter::new().unwrap();
        adapter.send(&format!("{}/hook", url), &down_event()).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("\"event\":\"down\""));
    }

    #[tokio::test]
    async fn test_adapter_reports_non_success_status() {
        let (url, server) = one_shot_server(500).await;
        let adapter = SlackAdapter::new().unwrap();
        let err = adapter.send(&url, &down_event()).await.unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Status {
                channel: Channel::Slack,
                status: 500
            }
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_sms_adapter_sends_form_with_basic_auth() {
        let (url, server) = one_shot_server(201).await;
        let adapter = SmsAdapter::new(SmsGatewayConfig {
            api_url: url,
            account: "AC123".to_string(),
            token: "secret".to_string(),
            from: "+15550000".to_string(),
        })
        .unwrap();
        adapter.send("+15551234", &down_event()).await.unwrap();
        let request = server.await.unwrap();
        let headers: HashMap<String, String> = request
            .lines()
            .skip(1)
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        assert!(request.starts_with("POST /Accounts/AC123/Messages.json"));
        assert!(headers["authorization"].starts_with("Basic "));
        assert_eq!(headers["content-type"], "application/x-www-form-urlencoded");
        assert!(request.contains("To=%2B15551234"));
    }
}
