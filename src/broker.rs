//! HTTP calls to the task broker: readiness and grant-token exchange.

use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::retry::{RetryError, RetryPolicy, retry};

/// Per-request timeout for broker calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GrantTokenResponse {
    data: GrantTokenData,
}

#[derive(Debug, Deserialize)]
struct GrantTokenData {
    token: String,
}

/// Build a blocking agent that hands back non-2xx responses instead of erroring.
pub fn http_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    ureq::Agent::new_with_config(config)
}

#[derive(Debug, Clone)]
pub struct BrokerClient {
    agent: ureq::Agent,
    base_uri: String,
}

impl BrokerClient {
    pub fn new(base_uri: &str) -> Self {
        Self {
            agent: http_agent(REQUEST_TIMEOUT),
            base_uri: base_uri.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// One readiness probe: `GET /healthz` must answer 200.
    pub fn check_ready(&self) -> anyhow::Result<()> {
        let url = format!("{}/healthz", self.base_uri);
        let resp = self
            .agent
            .get(&url)
            .call()
            .context("task broker readiness check failed")?;
        let status = resp.status().as_u16();
        if status != 200 {
            bail!("task broker readiness check failed with status code {status}");
        }
        Ok(())
    }

    /// Block until the broker reports ready. Only returns an error for a
    /// bounded `policy`.
    pub fn wait_until_ready(&self, policy: RetryPolicy) -> Result<(), RetryError> {
        tracing::info!(broker = %self.base_uri, "waiting for task broker to be ready");
        retry("readiness-check", policy, || self.check_ready())?;
        tracing::info!("task broker is ready");
        Ok(())
    }

    /// One exchange of the long-lived auth token for a single-use grant token.
    pub fn request_grant_token(&self, auth_token: &str) -> anyhow::Result<String> {
        let url = format!("{}/runners/auth", self.base_uri);
        let payload = serde_json::json!({ "token": auth_token }).to_string();

        let mut resp = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(payload.as_bytes())
            .context("failed to send grant token request")?;

        let status = resp.status().as_u16();
        if status != 200 {
            bail!("request to fetch grant token received status code {status}");
        }

        let body = resp
            .body_mut()
            .read_to_string()
            .context("failed to read grant token response")?;
        let parsed: GrantTokenResponse =
            serde_json::from_str(&body).context("failed to decode grant token response")?;
        if parsed.data.token.is_empty() {
            bail!("grant token response contained an empty token");
        }
        Ok(parsed.data.token)
    }

    /// Grant-token exchange with retries; exhaustion means the broker keeps
    /// rejecting us or is gone for good.
    pub fn fetch_grant_token(
        &self,
        auth_token: &str,
        policy: RetryPolicy,
    ) -> Result<String, RetryError> {
        retry("grant-token-fetch", policy, || {
            self.request_grant_token(auth_token)
        })
    }
}
