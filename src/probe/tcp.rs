//! TCP port probe implementation.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{ProbeError, ProbeResponse, ProbeStrategy, VantagePoint};
use crate::db::Target;

/// Attempts a raw TCP connection: connected is up, refused is down,
/// no answer by the deadline is a timeout.
pub struct TcpProbe;

#[async_trait]
impl ProbeStrategy for TcpProbe {
    async fn run(
        &self,
        target: &Target,
        _vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let port = target
            .port
            .ok_or_else(|| ProbeError::Config("tcp-port target has no port".to_string()))?;

        connect(&target.address, port, timeout).await?;
        Ok(ProbeResponse::default())
    }
}

/// Open and immediately drop a TCP connection.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError> {
    let host = strip_scheme(host);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(map_io_error(e, timeout)),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

pub(crate) fn map_io_error(e: std::io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        ErrorKind::ConnectionRefused => ProbeError::Refused(e.to_string()),
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
        _ => {
            let message = e.to_string();
            if message.contains("lookup") || message.contains("resolve") || message.contains("Name or service") {
                ProbeError::Dns(message)
            } else {
                ProbeError::Network(message)
            }
        }
    }
}

/// Accept `host`, `tcp://host` or a URL and return the bare host part.
pub fn strip_scheme(address: &str) -> &str {
    let without_scheme = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TargetKind;
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("db.internal"), "db.internal");
        assert_eq!(strip_scheme("tcp://db.internal"), "db.internal");
        assert_eq!(strip_scheme("https://example.com/path?q=1"), "example.com");
    }

    #[tokio::test]
    async fn test_tcp_probe_open_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Target {
            kind: TargetKind::TcpPort,
            address: "127.0.0.1".to_string(),
            port: Some(port),
            ..Default::default()
        };

        let result = TcpProbe
            .run(&target, &VantagePoint::local("local"), Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_is_refused() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = Target {
            kind: TargetKind::TcpPort,
            address: "127.0.0.1".to_string(),
            port: Some(port),
            ..Default::default()
        };

        let err = TcpProbe
            .run(&target, &VantagePoint::local("local"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Refused(_)));
    }

    #[tokio::test]
    async fn test_tcp_probe_requires_port() {
        let target = Target {
            kind: TargetKind::TcpPort,
            address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let err = TcpProbe
            .run(&target, &VantagePoint::local("local"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
