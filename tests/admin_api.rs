//! Admin API integration tests
//!
//! Tests for /healthz, /readyz, /livez, /stats, /metrics endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use eventgate::admin::{AdminServer, AdminState, HealthResponse, ReadyResponse, StatsResponse};
use eventgate::bootstrap::Gateway;
use eventgate::config::Config;
use eventgate::datagram::DatagramService;
use eventgate::telemetry::{counters, Metrics};

const CONFIG: &str = r#"
bridges:
  - name: ws
    address: "127.0.0.1:0"
    inbound_permitted: [{}]
    outbound_permitted: [{}]
datagram:
  - name: echo
    listen: "127.0.0.1:0"
    echo: true
modules:
  - eventgate~access-log~1.0
admin:
  address: "127.0.0.1:0"
settings:
  workers: 1
"#;

/// Test fixture that starts the admin server on an ephemeral port
struct TestServer {
    state: Arc<AdminState>,
    services: Arc<[DatagramService]>,
    addr: SocketAddr,
    token: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let config = Arc::new(Config::from_yaml(CONFIG).unwrap());
        let gateway = Arc::new(Gateway::new(config.clone()).unwrap());
        let services: Arc<[DatagramService]> = gateway.start_datagram().await.unwrap().into();
        let metrics = Metrics::install().unwrap();

        let state = Arc::new(AdminState::new(gateway, services.clone(), Some(metrics)));
        let server = AdminServer::bind(&config.admin, state.clone()).await.unwrap();
        let addr = server.local_addr();

        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));

        Self {
            state,
            services,
            addr,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.token.cancel();
        for service in self.services.iter() {
            service.stop().await;
        }
    }
}

#[tokio::test]
async fn test_healthz_returns_healthy() {
    let server = TestServer::start().await;

    let resp = reqwest::get(server.url("/healthz")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: HealthResponse = resp.json().await.expect("invalid json");
    assert_eq!(body.status, "healthy");
    assert_eq!(body.version, env!("CARGO_PKG_VERSION"));

    server.state.set_healthy(false);
    let resp = reqwest::get(server.url("/healthz")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    server.stop().await;
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let server = TestServer::start().await;

    let resp = reqwest::get(server.url("/readyz")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: ReadyResponse = resp.json().await.expect("invalid json");
    assert!(!body.ready);

    server.state.set_ready(true);
    let resp = reqwest::get(server.url("/readyz")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn test_livez_always_ok() {
    let server = TestServer::start().await;

    let resp = reqwest::get(server.url("/livez")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn test_stats_reports_components() {
    let server = TestServer::start().await;

    let resp = reqwest::get(server.url("/stats")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let stats: StatsResponse = resp.json().await.expect("invalid json");
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.bridges.len(), 1);
    assert_eq!(stats.bridges[0].name, "ws");
    assert_eq!(stats.modules, vec!["eventgate~access-log~1.0".to_string()]);
    // access log covers every lifecycle hook plus send_or_pub
    assert_eq!(stats.hooks.handlers, 6);
    assert_eq!(stats.datagram.len(), 1);
    assert_eq!(stats.datagram[0].kind, "echo");
    assert!(stats.datagram[0].local_addr.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_metrics_prometheus_text() {
    let server = TestServer::start().await;
    counters::bus_published();

    let resp = reqwest::get(server.url("/metrics")).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("eventgate_bus_published_total"));

    server.stop().await;
}
