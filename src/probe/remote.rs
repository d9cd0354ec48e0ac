//! Remote vantage points: delegate a probe to an agent running this binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ProbeError, VantagePoint, VANTAGE_HEADER};
use crate::db::{ProbeOutcome, Target};

/// Body of `POST /api/probe` on a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub target: Target,
    pub vantage: String,
    pub timeout_ms: u64,
}

/// Client side of the agent protocol.
pub struct RemoteProbe {
    client: reqwest::Client,
}

impl RemoteProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(super::USER_AGENT)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    /// Ask the vantage point's agent to probe `target` and return its outcome.
    pub async fn run(
        &self,
        target: &Target,
        vantage: &VantagePoint,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let endpoint = vantage
            .endpoint
            .as_deref()
            .ok_or_else(|| ProbeError::Config(format!("vantage {} has no endpoint", vantage.id)))?;
        let url = format!("{}/api/probe", endpoint.trim_end_matches('/'));

        let request = ProbeRequest {
            target: target.clone(),
            vantage: vantage.id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let response = self
            .client
            .post(&url)
            // The agent needs headroom to report its own timeout.
            .timeout(timeout + Duration::from_secs(2))
            .header(VANTAGE_HEADER, &vantage.id)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(timeout)
                } else {
                    ProbeError::Network(format!("agent {} unreachable: {}", vantage.id, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(ProbeError::Network(format!(
                "agent {} returned status {}",
                vantage.id,
                response.status()
            )));
        }

        let mut outcome: ProbeOutcome = response
            .json()
            .await
            .map_err(|e| ProbeError::Network(format!("agent {} sent invalid outcome: {}", vantage.id, e)))?;
        outcome.vantage = vantage.id.clone();
        Ok(outcome)
    }
}
