//! Lookup services consumed by the diagnostics collector.
//!
//! Each lookup is a trait so the collector can be exercised with scripted
//! fakes; the default implementations talk to real services.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use super::{DnsRecord, DnsResult, GeoDetail, HttpTiming, TlsDetail, TraceHop, TraceResult};
use crate::cache::ExpiringStore;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
    #[error("not applicable: {0}")]
    NotApplicable(String),
}

impl From<std::io::Error> for LookupError {
    fn from(e: std::io::Error) -> Self {
        LookupError::Failed(e.to_string())
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        LookupError::Failed(e.to_string())
    }
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<DnsResult, LookupError>;
}

#[async_trait]
pub trait PathTracer: Send + Sync {
    async fn trace(&self, host: &str) -> Result<TraceResult, LookupError>;
}

#[async_trait]
pub trait HttpTimer: Send + Sync {
    async fn time(&self, url: &str) -> Result<HttpTiming, LookupError>;
}

#[async_trait]
pub trait TlsInspector: Send + Sync {
    async fn inspect(&self, host: &str, port: u16) -> Result<TlsDetail, LookupError>;
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoDetail, LookupError>;
}

fn http_client() -> Result<reqwest::Client, LookupError> {
    reqwest::Client::builder()
        .user_agent(crate::probe::USER_AGENT)
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(LookupError::from)
}

fn tls_client_config() -> Result<Arc<rustls::ClientConfig>, LookupError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| LookupError::Failed(format!("tls protocol version error: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, LookupError> {
    rustls::pki_types::ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| LookupError::Failed(format!("invalid server name {}: {}", host, e)))
}

// ---------------------------------------------------------------------------
// DNS over HTTPS
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

fn record_type_name(code: u16) -> String {
    match code {
        1 => "A".to_string(),
        5 => "CNAME".to_string(),
        28 => "AAAA".to_string(),
        other => format!("TYPE{}", other),
    }
}

fn rcode_name(code: u32) -> &'static str {
    match code {
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        5 => "REFUSED",
        _ => "DNS error",
    }
}

/// Resolves through a DNS-over-HTTPS JSON endpoint (A and AAAA).
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub const DEFAULT_ENDPOINT: &'static str = "https://cloudflare-dns.com/dns-query";

    pub fn new(endpoint: impl Into<String>) -> Result<Self, LookupError> {
        Ok(Self {
            client: http_client()?,
            endpoint: endpoint.into(),
        })
    }

    async fn query(&self, host: &str, record_type: &str) -> Result<DohResponse, LookupError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("type", record_type)])
            .header("accept", "application/dns-json")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn resolve(&self, host: &str) -> Result<DnsResult, LookupError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(DnsResult {
                resolver: "literal".to_string(),
                query_ms: 0.0,
                records: vec![DnsRecord {
                    record_type: if ip.is_ipv4() { "A" } else { "AAAA" }.to_string(),
                    value: ip.to_string(),
                    ttl: 0,
                }],
            });
        }

        let start = Instant::now();
        let (v4, v6) = tokio::join!(self.query(host, "A"), self.query(host, "AAAA"));
        let query_ms = start.elapsed().as_secs_f64() * 1000.0;

        let v4 = v4?;
        if v4.status != 0 {
            return Err(LookupError::Failed(format!("{} for {}", rcode_name(v4.status), host)));
        }
        // AAAA is optional; plenty of hosts have no v6.
        let v6_answers = v6.map(|r| r.answer).unwrap_or_default();

        let records = v4
            .answer
            .into_iter()
            .chain(v6_answers)
            .map(|a| DnsRecord {
                record_type: record_type_name(a.record_type),
                value: a.data,
                ttl: a.ttl,
            })
            .collect();

        Ok(DnsResult {
            resolver: self.endpoint.clone(),
            query_ms,
            records,
        })
    }
}

// ---------------------------------------------------------------------------
// traceroute
// ---------------------------------------------------------------------------

fn hop_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.*)$").unwrap())
}

fn rtt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\d.]+)\s*ms").unwrap())
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3}(?:\.\d{1,3}){3}|[0-9a-fA-F:]*:[0-9a-fA-F:]+)$").unwrap())
}

/// Parse `traceroute -n` output into hops.
pub fn parse_traceroute(output: &str) -> Vec<TraceHop> {
    output
        .lines()
        .filter_map(|line| {
            let caps = hop_line_regex().captures(line)?;
            let hop: u32 = caps[1].parse().ok()?;
            let rest = &caps[2];

            let address = rest
                .split_whitespace()
                .find(|tok| address_regex().is_match(tok))
                .map(str::to_string);
            let rtts_ms: Vec<f64> = rtt_regex()
                .captures_iter(rest)
                .filter_map(|c| c[1].parse().ok())
                .collect();
            let lost = rest.split_whitespace().filter(|t| *t == "*").count();
            let sent = lost + rtts_ms.len();
            let loss_pct = if sent == 0 {
                100.0
            } else {
                lost as f64 * 100.0 / sent as f64
            };

            Some(TraceHop {
                hop,
                address,
                rtts_ms,
                loss_pct,
            })
        })
        .collect()
}

/// Runs the system `traceroute` binary.
pub struct TracerouteTracer {
    pub max_hops: u32,
}

impl Default for TracerouteTracer {
    fn default() -> Self {
        Self { max_hops: 20 }
    }
}

#[async_trait]
impl PathTracer for TracerouteTracer {
    async fn trace(&self, host: &str) -> Result<TraceResult, LookupError> {
        let output = tokio::process::Command::new("traceroute")
            .args(["-n", "-q", "3", "-w", "2", "-m"])
            .arg(self.max_hops.to_string())
            .arg(host)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LookupError::Failed(format!("traceroute unavailable: {}", e)))?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(LookupError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let hops = parse_traceroute(&String::from_utf8_lossy(&output.stdout));
        let completed = hops.last().map(|h| h.loss_pct < 100.0).unwrap_or(false);
        Ok(TraceResult { hops, completed })
    }
}

// ---------------------------------------------------------------------------
// HTTP timing
// ---------------------------------------------------------------------------

/// Issues a bare HTTP/1.1 GET and times each phase.
pub struct ManualHttpTimer {
    tls: Arc<rustls::ClientConfig>,
    max_body: usize,
}

impl ManualHttpTimer {
    pub fn new() -> Result<Self, LookupError> {
        Ok(Self {
            tls: tls_client_config()?,
            max_body: 1024 * 1024,
        })
    }
}

fn millis_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Send `request`, returning (first byte ms, total ms, status code), measured from `start`.
async fn exchange<S>(
    stream: &mut S,
    request: &str,
    start: Instant,
    max_body: usize,
) -> Result<(f64, f64, Option<u16>), LookupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; 16 * 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(LookupError::Failed("connection closed before response".to_string()));
    }
    let first_byte_ms = millis_since(start);
    let status_code = String::from_utf8_lossy(&buf[..n])
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok());

    let mut read = n;
    while read < max_body {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => read += n,
            // Servers often drop TLS without close_notify.
            Err(_) => break,
        }
    }
    Ok((first_byte_ms, millis_since(start), status_code))
}

#[async_trait]
impl HttpTimer for ManualHttpTimer {
    async fn time(&self, url: &str) -> Result<HttpTiming, LookupError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| LookupError::Failed(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| LookupError::Failed(format!("no host in {}", url)))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let https = parsed.scheme() == "https";
        let port = parsed.port_or_known_default().unwrap_or(if https { 443 } else { 80 });
        let path = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };

        let start = Instant::now();
        let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| LookupError::Failed(format!("no address for {}", host)))?;
        let dns_ms = millis_since(start);

        let tcp = TcpStream::connect(addr).await?;
        let connect_ms = millis_since(start);

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            path,
            host,
            crate::probe::USER_AGENT
        );

        let (tls_ms, (first_byte_ms, total_ms, status_code)) = if https {
            let connector = TlsConnector::from(self.tls.clone());
            let mut stream = connector
                .connect(server_name(&host)?, tcp)
                .await
                .map_err(|e| LookupError::Failed(format!("TLS handshake failed: {}", e)))?;
            let tls_ms = millis_since(start);
            (Some(tls_ms), exchange(&mut stream, &request, start, self.max_body).await?)
        } else {
            let mut stream = tcp;
            (None, exchange(&mut stream, &request, start, self.max_body).await?)
        };

        Ok(HttpTiming {
            dns_ms,
            connect_ms,
            tls_ms,
            first_byte_ms,
            total_ms,
            status_code,
        })
    }
}

// ---------------------------------------------------------------------------
// TLS certificate inspection
// ---------------------------------------------------------------------------

/// Handshakes against the webpki roots and parses the leaf certificate.
pub struct RustlsInspector {
    tls: Arc<rustls::ClientConfig>,
    cache: Arc<dyn ExpiringStore<String, TlsDetail>>,
}

impl RustlsInspector {
    pub fn new(cache: Arc<dyn ExpiringStore<String, TlsDetail>>) -> Result<Self, LookupError> {
        Ok(Self {
            tls: tls_client_config()?,
            cache,
        })
    }
}

/// Decode the fields we report from a DER certificate.
pub fn parse_certificate(der: &[u8]) -> Result<TlsDetail, LookupError> {
    use x509_parser::extensions::GeneralName;

    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| LookupError::Failed(format!("bad certificate: {}", e)))?;

    let sans = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => Some(IpAddr::from(<[u8; 4]>::try_from(*bytes).ok()?).to_string()),
                    16 => Some(IpAddr::from(<[u8; 16]>::try_from(*bytes).ok()?).to_string()),
                    _ => None,
                },
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let to_time = |secs: i64| {
        chrono::DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| LookupError::Failed(format!("certificate time out of range: {}", secs)))
    };
    let not_before = to_time(not_before)?;
    let not_after = to_time(not_after)?;
    let now = Utc::now();

    Ok(TlsDetail {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        sans,
        not_before,
        not_after,
        days_remaining: (not_after - now).num_days(),
        valid: now >= not_before && now <= not_after,
    })
}

#[async_trait]
impl TlsInspector for RustlsInspector {
    async fn inspect(&self, host: &str, port: u16) -> Result<TlsDetail, LookupError> {
        let key = format!("{}:{}", host, port);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let tcp = TcpStream::connect((host, port)).await?;
        let connector = TlsConnector::from(self.tls.clone());
        let stream = connector
            .connect(server_name(host)?, tcp)
            .await
            .map_err(|e| LookupError::Failed(format!("TLS handshake failed: {}", e)))?;

        let (_, session) = stream.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| LookupError::Failed("server sent no certificate".to_string()))?;
        let detail = parse_certificate(leaf.as_ref())?;

        self.cache.insert(key, detail.clone());
        Ok(detail)
    }
}

// ---------------------------------------------------------------------------
// Geo / ASN
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(rename = "as", default)]
    asn: Option<String>,
}

const CDN_MARKERS: &[(&str, &str)] = &[
    ("cloudflare", "Cloudflare"),
    ("akamai", "Akamai"),
    ("fastly", "Fastly"),
    ("cloudfront", "CloudFront"),
    ("amazon", "CloudFront"),
    ("google", "Google Cloud CDN"),
    ("microsoft", "Azure CDN"),
    ("azure", "Azure CDN"),
    ("incapsula", "Imperva"),
    ("imperva", "Imperva"),
    ("stackpath", "StackPath"),
    ("bunny", "BunnyCDN"),
    ("edgecast", "Edgio"),
    ("limelight", "Edgio"),
];

/// Classify a network owner string as a known CDN, if it is one.
pub fn classify_cdn(owner: &str) -> Option<String> {
    let lower = owner.to_ascii_lowercase();
    CDN_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, name)| name.to_string())
}

/// ip-api style JSON geo lookup.
pub struct IpApiGeo {
    client: reqwest::Client,
    endpoint: String,
}

impl IpApiGeo {
    pub const DEFAULT_ENDPOINT: &'static str = "http://ip-api.com/json";

    pub fn new(endpoint: impl Into<String>) -> Result<Self, LookupError> {
        Ok(Self {
            client: http_client()?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiGeo {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoDetail, LookupError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), ip);
        let body: IpApiResponse = self
            .client
            .get(&url)
            .query(&[("fields", "status,message,country,city,isp,org,as,query")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if body.status != "success" {
            return Err(LookupError::Failed(
                body.message.unwrap_or_else(|| "geo lookup failed".to_string()),
            ));
        }

        let cdn = [&body.org, &body.isp, &body.asn]
            .into_iter()
            .flatten()
            .find_map(|owner| classify_cdn(owner));

        Ok(GeoDetail {
            ip: ip.to_string(),
            country: body.country,
            city: body.city,
            isp: body.isp,
            org: body.org,
            asn: body.asn,
            cdn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEROUTE: &str = "\
traceroute to 93.184.216.34 (93.184.216.34), 20 hops max, 60 byte packets
 1  192.168.1.1  0.512 ms  0.488 ms  0.470 ms
 2  * * *
 3  10.20.0.1  8.120 ms *  8.301 ms
 4  2001:db8::1  12.4 ms  12.9 ms  13.0 ms
";

    #[test]
    fn test_parse_traceroute() {
        let hops = parse_traceroute(TRACEROUTE);
        assert_eq!(hops.len(), 4);

        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].address.as_deref(), Some("192.168.1.1"));
        assert_eq!(hops[0].rtts_ms, vec![0.512, 0.488, 0.470]);
        assert_eq!(hops[0].loss_pct, 0.0);

        assert_eq!(hops[1].address, None);
        assert_eq!(hops[1].loss_pct, 100.0);

        assert_eq!(hops[2].rtts_ms.len(), 2);
        assert!((hops[2].loss_pct - 33.333).abs() < 0.01);

        assert_eq!(hops[3].address.as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_classify_cdn() {
        assert_eq!(classify_cdn("AS13335 Cloudflare, Inc.").as_deref(), Some("Cloudflare"));
        assert_eq!(classify_cdn("Amazon.com, Inc.").as_deref(), Some("CloudFront"));
        assert_eq!(classify_cdn("Hetzner Online GmbH"), None);
    }

    #[tokio::test]
    async fn test_doh_resolver_passes_ip_literals_through() {
        let resolver = DohResolver::new("http://127.0.0.1:9").unwrap();
        let result = resolver.resolve("10.1.2.3").await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].record_type, "A");
        assert_eq!(result.addresses(), vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_http_timer_against_local_server() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let timer = ManualHttpTimer::new().unwrap();
        let timing = timer.time(&format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(timing.status_code, Some(204));
        assert_eq!(timing.tls_ms, None);
        assert!(timing.connect_ms >= timing.dns_ms);
        assert!(timing.total_ms >= timing.first_byte_ms);
    }

    #[test]
    fn test_tls_config_builds() {
        assert!(tls_client_config().is_ok());
    }
}
