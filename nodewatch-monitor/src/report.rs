//! Status reporting to `POST /api/report`.
//!
//! The report endpoint authenticates each node by its own report token, so the client
//! carries no operator bearer. Failed attempts are retried with `2^attempt` backoff, except
//! a 403 token rejection which will not fix itself.

use crate::api::ApiError;
use crate::backoff;
use crate::config::ConfigStore;
use crate::cycle::Shutdown;
use crate::models::{HealthCheckResult, NodeRecord, ReportAck, ReportEnvelope, ReportStatus};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

/// Body fragments the report endpoint uses for a rejected token.
const TOKEN_REJECTED_MARKERS: [&str; 2] = ["Token验证失败", "token validation failed"];

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("no report token stored for {0}")]
    MissingToken(String),
    #[error("no owner email for {0}")]
    MissingEmail(String),
    #[error("report token rejected for {node}: {detail}")]
    TokenRejected { node: String, detail: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportTally {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct StatusReporter {
    report_url: String,
    client: Client,
    tokens: ConfigStore,
    max_retries: u32,
    backoff_unit: Duration,
    node_delay: Duration,
}

impl StatusReporter {
    pub fn new(base_url: &str, tokens: ConfigStore, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build().map_err(ApiError::Client)?;
        Ok(Self {
            report_url: format!("{}/api/report", base_url.trim_end_matches('/')),
            client,
            tokens,
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            node_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_unit: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_unit = backoff_unit;
        self
    }

    pub fn with_node_delay(mut self, node_delay: Duration) -> Self {
        self.node_delay = node_delay;
        self
    }

    /// Fails before any network traffic when the node cannot be reported.
    pub fn build_envelope(&self, node: &NodeRecord, health: &HealthCheckResult) -> Result<ReportEnvelope, ReportError> {
        let token = self
            .tokens
            .report_token(&node.name)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ReportError::MissingToken(node.name.clone()))?;
        let email = node
            .owner_email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ReportError::MissingEmail(node.name.clone()))?;

        Ok(ReportEnvelope {
            node_name: node.name.clone(),
            email,
            token,
            current_bandwidth: node.metric("current_bandwidth"),
            reported_traffic: node.metric("reported_traffic"),
            connection_count: health.connection_count,
            tier_bandwidth: node.tier_bandwidth,
            status: if health.is_online {
                ReportStatus::Online
            } else {
                ReportStatus::Offline
            },
        })
    }

    /// Posts the envelope: at most `max_retries + 1` attempts.
    pub async fn send(&self, envelope: &ReportEnvelope) -> Result<ReportAck, ReportError> {
        let mut attempt = 0;
        loop {
            match self.post_once(envelope).await {
                Ok(ack) => return Ok(ack),
                Err(e @ ReportError::TokenRejected { .. }) => return Err(e),
                Err(e) if attempt < self.max_retries => {
                    let delay = backoff::delay_for(attempt, self.backoff_unit);
                    warn!(
                        node = %envelope.node_name,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        ?delay,
                        error = %e,
                        "report failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, envelope: &ReportEnvelope) -> Result<ReportAck, ReportError> {
        let url = self.report_url.as_str();
        let resp = self
            .client
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body).unwrap_or_default());
        }

        let detail = serde_json::from_str::<Value>(&body)
            .map(|v| v.to_string())
            .unwrap_or_else(|_| body.clone());
        error!(node = %envelope.node_name, status = status.as_u16(), %detail, "report endpoint returned an error");

        if status == StatusCode::FORBIDDEN && TOKEN_REJECTED_MARKERS.iter().any(|m| body.contains(m)) {
            return Err(ReportError::TokenRejected {
                node: envelope.node_name.clone(),
                detail,
            });
        }
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        }
        .into())
    }

    /// Reports one node. Never fails: every error is logged and yields `false`.
    pub async fn report(&self, node: &NodeRecord, health: &HealthCheckResult) -> bool {
        let envelope = match self.build_envelope(node, health) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(node_id = node.id, node = %node.name, error = %e, "cannot report node");
                return false;
            }
        };

        info!(node = %node.name, status = ?envelope.status, connections = envelope.connection_count, "reporting");
        match self.send(&envelope).await {
            Ok(ack) => {
                match (ack.used_traffic, ack.max_traffic) {
                    (Some(used), Some(max)) => info!(node = %node.name, used_gb = used, max_gb = max, "report accepted"),
                    _ => info!(node = %node.name, "report accepted"),
                }
                true
            }
            Err(e @ ReportError::TokenRejected { .. }) => {
                warn!(node = %node.name, error = %e, "report token rejected, regenerate it on the management site");
                false
            }
            Err(e) => {
                error!(node = %node.name, error = %e, "report failed");
                false
            }
        }
    }

    /// Reports every node in order with `node_delay` between them. Once shutdown is
    /// requested the remaining reports go out without pacing.
    pub async fn report_all(&self, items: &[(NodeRecord, HealthCheckResult)], shutdown: &Shutdown) -> ReportTally {
        let mut tally = ReportTally::default();
        for (i, (node, health)) in items.iter().enumerate() {
            if i > 0 {
                shutdown.sleep(self.node_delay).await;
            }
            if self.report(node, health).await {
                tally.succeeded += 1;
            } else {
                tally.failed += 1;
            }
        }
        info!(succeeded = tally.succeeded, failed = tally.failed, "reporting done");
        tally
    }
}
