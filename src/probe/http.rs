//! HTTP probe implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use super::{ProbeError, ProbeResponse, ProbeStrategy, VantagePoint, USER_AGENT, VANTAGE_HEADER};
use crate::db::{ProbeAuth, Target};

/// Probes an HTTP(S) endpoint with the target's method, headers, body and auth.
///
/// 2xx and 3xx responses are up; anything else is down with its status code.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    fn build_request(
        &self,
        target: &Target,
        vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<reqwest::RequestBuilder, ProbeError> {
        let method = Method::from_bytes(target.method.to_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid method: {}", target.method)))?;

        let mut request = self
            .client
            .request(method, normalize_url(&target.address))
            .timeout(timeout)
            .header(VANTAGE_HEADER, &vantage.id);

        for (key, value) in &target.headers {
            request = request.header(key, value);
        }

        request = match &target.auth {
            ProbeAuth::None => request,
            ProbeAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            ProbeAuth::Bearer { token } => request.bearer_auth(token),
        };

        if let Some(body) = &target.body {
            request = request.body(body.clone());
        }

        Ok(request)
    }
}

#[async_trait]
impl ProbeStrategy for HttpProbe {
    async fn run(
        &self,
        target: &Target,
        vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let request = self.build_request(target, vantage, timeout)?;

        let response = request.send().await.map_err(|e| classify_error(e, timeout))?;
        let status = response.status();

        // Read the full body to measure complete transfer time
        let _body = response.bytes().await.map_err(|e| classify_error(e, timeout))?;

        if status.is_success() || status.is_redirection() {
            Ok(ProbeResponse {
                status_code: Some(status.as_u16()),
            })
        } else {
            Err(ProbeError::HttpStatus(status.as_u16()))
        }
    }
}

/// Prefix bare hosts with `http://`.
pub fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn classify_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    let chain = error_chain(&e);
    let lower = chain.to_lowercase();
    if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
        ProbeError::Dns(chain)
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        ProbeError::Tls(chain)
    } else if lower.contains("refused") {
        ProbeError::Refused(chain)
    } else {
        ProbeError::Network(chain)
    }
}

/// Flatten an error and its sources into one message.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
