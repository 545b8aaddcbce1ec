//! HTTP clients for the two node registries.
//!
//! - [`RemoteApi`]: the authoritative management API (Source A). Every request carries the
//!   operator bearer token; reads retry with exponential backoff.
//! - [`LocalApi`]: the management service running next to the monitor (Source B/C).
//!
//! The reconciler only sees the [`AuthoritativeSource`] and [`LocalRegistry`] traits.

use crate::backoff;
use crate::models::{NodeDetailBody, NodeId, NodeListBody, NodeRecord};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("unexpected body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("bearer token contains characters not allowed in a header")]
    InvalidToken,
}

impl ApiError {
    /// Transport errors, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Turns a response into `T`, keeping the body text of non-2xx answers.
pub(crate) async fn read_json<T: DeserializeOwned>(url: &str, resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(|source| ApiError::Transport {
        url: url.to_string(),
        source,
    })?;
    if !status.is_success() {
        return Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

async fn expect_success(url: &str, resp: Response) -> Result<(), ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn transport(url: &str) -> impl FnOnce(reqwest::Error) -> ApiError + '_ {
    move |source| ApiError::Transport {
        url: url.to_string(),
        source,
    }
}

#[allow(async_fn_in_trait)]
pub trait AuthoritativeSource {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError>;
    async fn fetch_node(&self, id: NodeId) -> Result<NodeRecord, ApiError>;
}

#[allow(async_fn_in_trait)]
pub trait LocalRegistry {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError>;
    async fn create_node(&self, node: &NodeRecord) -> Result<(), ApiError>;
    async fn update_node(&self, node: &NodeRecord) -> Result<(), ApiError>;
    async fn delete_node(&self, id: NodeId) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct RemoteApi {
    base_url: String,
    client: Client,
    max_retries: u32,
    backoff_unit: Duration,
}

impl RemoteApi {
    pub fn new(base_url: &str, jwt_token: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {jwt_token}")).map_err(|_| ApiError::InvalidToken)?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_unit: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_unit = backoff_unit;
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, route);
        let mut attempt = 0;
        loop {
            let outcome = match self.client.get(&url).send().await {
                Ok(resp) => read_json(&url, resp).await,
                Err(source) => Err(transport(&url)(source)),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff::delay_for(attempt, self.backoff_unit);
                    warn!(%url, attempt = attempt + 1, ?delay, error = %e, "remote read failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `GET /api/nodes/all`
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let body: NodeListBody = self.get_json("/api/nodes/all").await?;
        let nodes = body.into_nodes();
        debug!(count = nodes.len(), "remote nodes fetched");
        Ok(nodes)
    }

    /// `GET /api/nodes/{id}`, the only place the report token is exposed.
    pub async fn node_detail(&self, id: NodeId) -> Result<NodeRecord, ApiError> {
        let body: NodeDetailBody = self.get_json(&format!("/api/nodes/{id}")).await?;
        Ok(body.node)
    }
}

impl AuthoritativeSource for RemoteApi {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        self.list_nodes().await
    }

    async fn fetch_node(&self, id: NodeId) -> Result<NodeRecord, ApiError> {
        self.node_detail(id).await
    }
}

#[derive(Clone)]
pub struct LocalApi {
    base_url: String,
    client: Client,
}

impl LocalApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build().map_err(ApiError::Client)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    /// `GET /health` answers 2xx
    pub async fn health(&self) -> bool {
        match self.client.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let url = format!("{}/api/nodes", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(transport(&url))?;
        let body: NodeListBody = read_json(&url, resp).await?;
        Ok(body.into_nodes())
    }

    pub async fn create_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
        let url = format!("{}/api/nodes", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&node.without_credentials())
            .send()
            .await
            .map_err(transport(&url))?;
        expect_success(&url, resp).await
    }

    pub async fn update_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
        let url = format!("{}/api/nodes/{}", self.base_url, node.id);
        let resp = self
            .client
            .put(&url)
            .json(&node.without_credentials())
            .send()
            .await
            .map_err(transport(&url))?;
        expect_success(&url, resp).await
    }

    pub async fn delete_node(&self, id: NodeId) -> Result<(), ApiError> {
        let url = format!("{}/api/nodes/{}", self.base_url, id);
        let resp = self.client.delete(&url).send().await.map_err(transport(&url))?;
        expect_success(&url, resp).await
    }
}

impl LocalRegistry for LocalApi {
    async fn fetch_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        self.list_nodes().await
    }

    async fn create_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
        LocalApi::create_node(self, node).await
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<(), ApiError> {
        LocalApi::update_node(self, node).await
    }

    async fn delete_node(&self, id: NodeId) -> Result<(), ApiError> {
        LocalApi::delete_node(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodewatch_devkit::fixtures::{node_body, nodes_body, NodeBuilder};
    use nodewatch_devkit::TestHarness;
    use serde_json::{json, Value};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_remote_list_sends_bearer() {
        let h = TestHarness::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes/all"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(nodes_body(vec![
                NodeBuilder::new(1, "hk-1").connection("tcp", "10.0.0.1", 11010).build(),
            ])))
            .expect(1)
            .mount(&h.remote)
            .await;

        let api = RemoteApi::new(&format!("{}/", h.remote_url()), "jwt-1", TIMEOUT).unwrap();
        let nodes = api.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "hk-1");
    }

    #[tokio::test]
    async fn test_remote_list_keeps_good_records_around_a_bad_one() {
        let h = TestHarness::start().await;
        h.mount_remote_nodes(vec![
            NodeBuilder::new(1, "hk-1").connection("tcp", "10.0.0.1", 11010).build(),
            json!({"id": 2, "node_name": "broken", "tier_bandwidth": "fast"}),
            NodeBuilder::new(3, "hk-3").build(),
        ])
        .await;

        let api = RemoteApi::new(&h.remote_url(), "jwt", TIMEOUT).unwrap();
        let names: Vec<String> = api.list_nodes().await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["hk-1", "hk-3"]);
    }

    #[tokio::test]
    async fn test_remote_detail_carries_token() {
        let h = TestHarness::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(node_body(
                NodeBuilder::new(9, "n9").token("tok-9").build(),
            )))
            .mount(&h.remote)
            .await;

        let api = RemoteApi::new(&h.remote_url(), "jwt", TIMEOUT).unwrap();
        let node = api.node_detail(9).await.unwrap();
        assert_eq!(node.report_token.as_deref(), Some("tok-9"));
    }

    #[tokio::test]
    async fn test_remote_read_retries_server_errors() {
        let h = TestHarness::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes/all"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&h.remote)
            .await;
        h.mount_remote_nodes(vec![NodeBuilder::new(1, "a").build()]).await;

        let api = RemoteApi::new(&h.remote_url(), "jwt", TIMEOUT)
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        assert_eq!(api.list_nodes().await.unwrap().len(), 1);
        assert_eq!(TestHarness::requests_to(&h.remote, "GET", "/api/nodes/all").await.len(), 3);
    }

    #[tokio::test]
    async fn test_remote_client_errors_are_not_retried() {
        let h = TestHarness::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes/all"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unauthorized"})))
            .expect(1)
            .mount(&h.remote)
            .await;

        let api = RemoteApi::new(&h.remote_url(), "jwt", TIMEOUT)
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        match api.list_nodes().await {
            Err(ApiError::Status { status, body, .. }) => {
                assert_eq!(status, 401);
                assert!(body.contains("unauthorized"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_header_injection_rejected() {
        assert!(matches!(
            RemoteApi::new("http://x", "bad\ntoken", TIMEOUT),
            Err(ApiError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_local_bare_list_and_writes() {
        let h = TestHarness::start().await;
        Mock::given(method("GET"))
            .and(path("/api/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "name": "n3", "connections": "[]"}
            ])))
            .mount(&h.local)
            .await;
        h.mount_local_writes().await;

        let api = LocalApi::new(&h.local_url(), TIMEOUT).unwrap();
        let nodes = api.list_nodes().await.unwrap();
        assert_eq!(nodes[0].name, "n3");

        let mut node = NodeRecord::new(5, "n5");
        node.report_token = Some("secret".into());
        api.create_node(&node).await.unwrap();
        api.update_node(&node).await.unwrap();
        api.delete_node(3).await.unwrap();

        assert_eq!(
            h.local_writes().await,
            vec!["POST /api/nodes", "PUT /api/nodes/5", "DELETE /api/nodes/3"]
        );
        let created = TestHarness::requests_to(&h.local, "POST", "/api/nodes").await;
        let body: Value = created[0].body_json().unwrap();
        assert_eq!(body["node_name"], "n5");
        assert!(body.get("report_token").is_none());
    }

    #[tokio::test]
    async fn test_local_health() {
        let h = TestHarness::start().await;
        let api = LocalApi::new(&h.local_url(), TIMEOUT).unwrap();
        assert!(!api.health().await);
        h.mount_local_health().await;
        assert!(api.health().await);
    }
}
