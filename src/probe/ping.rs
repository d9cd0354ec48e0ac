//! Reachability probe: native ICMP echo where the process may open ICMP
//! sockets, otherwise a lightweight TCP connection as a stand-in.
//!
//! ICMP runs on blocking sockets in spawn_blocking for sub-millisecond timing.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};

use super::tcp::{connect, strip_scheme};
use super::{ProbeError, ProbeResponse, ProbeStrategy, VantagePoint};
use crate::db::Target;

/// Ports tried, in order, when ICMP is unavailable.
const FALLBACK_PORTS: [u16; 2] = [443, 80];

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only the TCP stand-in is available
    TcpOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Kind of ICMP socket a ping was sent on.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpSocketKind {
    /// Replies carry the IPv4 header and our identifier.
    Raw,
    /// The kernel strips the IPv4 header and rewrites the identifier to the
    /// socket's local port.
    Dgram,
}

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Reachability strategy for `reachability` targets.
#[derive(Debug, Clone, Default)]
pub struct ReachabilityProbe {
    /// Skip ICMP even when it is available.
    force_tcp: bool,
}

impl ReachabilityProbe {
    pub fn tcp_only() -> Self {
        Self { force_tcp: true }
    }
}

#[async_trait]
impl ProbeStrategy for ReachabilityProbe {
    async fn run(
        &self,
        target: &Target,
        _vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let host = strip_scheme(&target.address);
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native && !self.force_tcp {
            match run_icmp(host, timeout).await {
                Ok(_) => return Ok(ProbeResponse::default()),
                Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to TCP: {}",
                        host,
                        msg
                    );
                }
                Err(e) => return Err(e),
            }
        }

        run_tcp_fallback(host, target.port, timeout).await
    }
}

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Reachability probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Reachability probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Reachability probe: native ICMP unavailable, using TCP connect");
    IcmpCapability::TcpOnly
}

fn is_permission_error(message: &str) -> bool {
    message.contains("Permission")
        || message.contains("Operation not permitted")
        || message.contains("denied")
}

/// A host that accepts or actively refuses a connection is reachable.
async fn run_tcp_fallback(
    host: &str,
    port: Option<u16>,
    timeout: Duration,
) -> Result<ProbeResponse, ProbeError> {
    let ports: Vec<u16> = match port {
        Some(p) => vec![p],
        None => FALLBACK_PORTS.to_vec(),
    };
    let per_port = timeout / ports.len() as u32;

    let mut last_err = ProbeError::Timeout(timeout);
    for port in ports {
        match connect(host, port, per_port).await {
            Ok(()) | Err(ProbeError::Refused(_)) => return Ok(ProbeResponse::default()),
            Err(ProbeError::Timeout(_)) => last_err = ProbeError::Timeout(timeout),
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

async fn run_icmp(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    // Resolve address before spawn_blocking (DNS is async)
    let ip = resolve_address(address).await?;

    // Run blocking ICMP in dedicated thread for precise timing
    tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
}

/// Resolve hostname to IP address.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Dns(e.to_string()))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Dns(format!("No addresses found for {}", address)))
}

/// Run blocking ICMP ping with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, kind) = Socket::new(domain, Type::RAW, Some(protocol))
        .map(|s| (s, IcmpSocketKind::Raw))
        .or_else(|_| {
            Socket::new(domain, Type::DGRAM, Some(protocol)).map(|s| (s, IcmpSocketKind::Dgram))
        })
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    // Start timing just before send
    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Receive reply - loop until we get OUR reply or timeout
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(ip, kind, buf, identifier, sequence) {
            return Ok(elapsed);
        }
        // Received something else, keep waiting
    }
}

/// Whether `buf` is the echo reply to our request.
///
/// DGRAM replies are matched on sequence alone since the kernel owns the identifier.
fn is_echo_reply(ip: IpAddr, kind: IcmpSocketKind, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    let (offset, reply_type) = match ip {
        IpAddr::V4(_) if kind == IcmpSocketKind::Raw => {
            let header_len = buf.first().map(|b| ((b & 0x0f) as usize) * 4).unwrap_or(20);
            (header_len, 0u8)
        }
        IpAddr::V4(_) => (0, 0u8),
        IpAddr::V6(_) => (0, 129u8),
    };
    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    let id_matches = kind == IcmpSocketKind::Dgram || reply_id == identifier;
    icmp[0] == reply_type && id_matches && reply_seq == sequence
}

fn echo_payload_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&echo_payload_timestamp().to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&echo_payload_timestamp().to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
