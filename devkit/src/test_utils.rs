/*!
Test harness for the monitor

Starts two mock HTTP servers standing in for the remote management API (Source A, report
endpoint) and the local management service (Source B/C), with helpers to mount the
endpoints the monitor talks to and to inspect what it sent.
*/

use serde_json::Value;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub struct TestHarness {
    pub remote: MockServer,
    pub local: MockServer,
}

impl TestHarness {
    pub async fn start() -> Self {
        env_logger::try_init().ok();
        Self {
            remote: MockServer::start().await,
            local: MockServer::start().await,
        }
    }

    pub fn remote_url(&self) -> String {
        self.remote.uri()
    }

    pub fn local_url(&self) -> String {
        self.local.uri()
    }

    /// `GET /api/nodes/all` on the remote API
    pub async fn mount_remote_nodes(&self, nodes: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/api/nodes/all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(crate::fixtures::nodes_body(nodes)))
            .mount(&self.remote)
            .await;
    }

    /// `GET /api/nodes/{id}` on the remote API
    pub async fn mount_remote_detail(&self, node: Value) {
        let id = node["id"].as_i64().unwrap_or_default();
        Mock::given(method("GET"))
            .and(path(format!("/api/nodes/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(crate::fixtures::node_body(node)))
            .mount(&self.remote)
            .await;
    }

    /// `POST /api/report` answering `status` with `body`
    pub async fn mount_report(&self, status: u16, body: Value) {
        Mock::given(method("POST"))
            .and(path("/api/report"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.remote)
            .await;
    }

    /// `GET /api/nodes` on the local service
    pub async fn mount_local_nodes(&self, nodes: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/api/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(crate::fixtures::nodes_body(nodes)))
            .mount(&self.local)
            .await;
    }

    /// Accepts every create, update and delete on the local service.
    pub async fn mount_local_writes(&self) {
        Mock::given(method("POST"))
            .and(path("/api/nodes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"success": true})))
            .mount(&self.local)
            .await;
        for verb in ["PUT", "DELETE"] {
            Mock::given(method(verb))
                .and(path_regex(r"^/api/nodes/-?\d+$"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
                .mount(&self.local)
                .await;
        }
    }

    /// `GET /health` on the local service
    pub async fn mount_local_health(&self) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.local)
            .await;
    }

    /// Requests `server` received matching `verb` and an exact `route`.
    pub async fn requests_to(server: &MockServer, verb: &str, route: &str) -> Vec<Request> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == verb && r.url.path() == route)
            .collect()
    }

    /// Paths of every write (`POST`/`PUT`/`DELETE`) the local service received, in order.
    pub async fn local_writes(&self) -> Vec<String> {
        let writes: Vec<String> = self
            .local
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() != "GET")
            .map(|r| format!("{} {}", r.method.as_str(), r.url.path()))
            .collect();
        log::info!("local writes: {writes:?}");
        writes
    }
}
