//! End-to-end tests: a real entry point proxying to a real backend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use gatehouse::config::model::Config;
use gatehouse::entrypoint::list::EntryPointList;
use gatehouse::error::GatewayError;
use gatehouse::middleware::retry::RetryListener;
use gatehouse::server::build_routers;
use gatehouse::transport::manager::RoundTripperManager;
use parking_lot::Mutex;
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorder(Mutex<Vec<u32>>);

impl RetryListener for Recorder {
    fn retried(&self, _req: &http::request::Parts, attempt: u32) {
        self.0.lock().push(attempt);
    }
}

#[derive(Clone, Default)]
struct Backend {
    calls: Arc<AtomicUsize>,
}

/// Backend echoing the URI and forwarding headers it received. `/unavailable`
/// always answers 503.
async fn spawn_backend() -> (SocketAddr, Backend) {
    async fn handle(
        State(backend): State<Backend>,
        uri: Uri,
        headers: HeaderMap,
    ) -> (StatusCode, HeaderMap, String) {
        backend.calls.fetch_add(1, Ordering::SeqCst);
        if uri.path() == "/unavailable" {
            return (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), String::new());
        }
        let mut echoed = HeaderMap::new();
        for name in [
            "host",
            "x-replaced-host",
            "x-forwarded-for",
            "x-forwarded-proto",
            "x-hop",
        ] {
            if let Some(value) = headers.get(name) {
                echoed.insert(
                    http::HeaderName::from_bytes(format!("x-seen-{name}").as_bytes()).unwrap(),
                    value.clone(),
                );
            }
        }
        (StatusCode::OK, echoed, uri.to_string())
    }

    let backend = Backend::default();
    let app = Router::new().fallback(handle).with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, backend)
}

/// An address nothing listens on.
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_gateway(
    config: &Config,
    listener: Arc<dyn RetryListener>,
) -> (Arc<EntryPointList>, Arc<RoundTripperManager>, SocketAddr) {
    let manager = Arc::new(RoundTripperManager::new());
    manager.update(config.transport_configs());
    let routers = build_routers(config, &manager, &listener).unwrap();
    let entry_points = Arc::new(
        EntryPointList::bind(&config.entry_points, routers)
            .await
            .unwrap(),
    );
    entry_points.start();
    let addr = entry_points.get("web").unwrap().local_addr();
    (entry_points, manager, addr)
}

fn config_to(backend: SocketAddr, extra_middleware: &str) -> Config {
    let json = format!(
        r#"{{
            "entryPoints": {{ "web": {{ "address": "127.0.0.1:0" }} }},
            "middleware": {{
                "replaceHost": {{ "scheme": "http", "host": "{backend}" }}
                {extra_middleware}
            }}
        }}"#
    );
    serde_json::from_str(&json).unwrap()
}

#[tokio::test]
async fn forwards_to_replaced_host() {
    let (backend_addr, backend) = spawn_backend().await;
    let config = config_to(backend_addr, "");
    let (entry_points, _, addr) = start_gateway(&config, Arc::new(Recorder::default())).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/foo?x=1"))
        .header("connection", "keep-alive, x-hop")
        .header("x-hop", "secret")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.headers()["x-replaced-host"], addr.to_string().as_str());
    assert_eq!(resp.headers()["x-seen-host"], backend_addr.to_string().as_str());
    assert_eq!(resp.headers()["x-seen-x-forwarded-for"], "127.0.0.1");
    assert!(!resp.headers().contains_key("x-seen-x-hop"));
    assert_eq!(resp.text().await.unwrap(), "/foo?x=1");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    entry_points.stop().await;
}

#[tokio::test]
async fn dead_backend_is_retried_then_reported_as_bad_gateway() {
    let config = config_to(
        dead_address().await,
        r#", "retry": { "attempts": 3, "initialInterval": "10ms" }"#,
    );
    let recorder = Arc::new(Recorder::default());
    let (entry_points, _, addr) = start_gateway(&config, recorder.clone()).await;

    let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();

    assert_eq!(resp.status(), 502);
    assert_eq!(resp.text().await.unwrap(), "Bad Gateway");
    assert_eq!(*recorder.0.lock(), vec![2, 3]);

    entry_points.stop().await;
}

#[tokio::test]
async fn backend_answer_is_never_retried() {
    let (backend_addr, backend) = spawn_backend().await;
    let config = config_to(
        backend_addr,
        r#", "retry": { "attempts": 3, "initialInterval": "10ms" }"#,
    );
    let recorder = Arc::new(Recorder::default());
    let (entry_points, _, addr) = start_gateway(&config, recorder.clone()).await;

    let resp = reqwest::get(format!("http://{addr}/unavailable")).await.unwrap();

    assert_eq!(resp.status(), 503);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert!(recorder.0.lock().is_empty());

    entry_points.stop().await;
}

#[tokio::test]
async fn rate_limited_requests_get_retry_after() {
    let (backend_addr, _) = spawn_backend().await;
    let config = config_to(
        backend_addr,
        r#", "rateLimit": { "every": "1m", "burst": 1 }"#,
    );
    let (entry_points, _, addr) = start_gateway(&config, Arc::new(Recorder::default())).await;
    let client = reqwest::Client::new();

    let first = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(first.status(), 200);

    let second = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));
    assert!(second.headers().contains_key("x-retry-in"));

    entry_points.stop().await;
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/tls/{name}", env!("CARGO_MANIFEST_DIR"))
}

#[tokio::test]
async fn tls_and_plaintext_share_one_entry_point() {
    let (backend_addr, backend) = spawn_backend().await;
    let config: Config = serde_json::from_value(serde_json::json!({
        "entryPoints": {
            "web": {
                "address": "127.0.0.1:0",
                "tls": {
                    "certificates": [
                        { "certFile": fixture("server.pem"), "keyFile": fixture("server.key") }
                    ]
                }
            }
        },
        "middleware": {
            "replaceHost": { "scheme": "http", "host": backend_addr.to_string() }
        }
    }))
    .unwrap();
    let (entry_points, _, addr) = start_gateway(&config, Arc::new(Recorder::default())).await;
    assert!(entry_points.get("web").unwrap().is_tls());

    let ca = std::fs::read(fixture("ca.pem")).unwrap();
    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(&ca).unwrap())
        .build()
        .unwrap();

    let secure = client
        .get(format!("https://{addr}/secure"))
        .send()
        .await
        .unwrap();
    assert_eq!(secure.status(), 200);
    assert_eq!(secure.headers()["x-seen-x-forwarded-proto"], "https");
    assert_eq!(secure.text().await.unwrap(), "/secure");

    let plain = client
        .get(format!("http://{addr}/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(plain.status(), 200);
    assert_eq!(plain.headers()["x-seen-x-forwarded-proto"], "http");
    assert_eq!(plain.text().await.unwrap(), "/plain");

    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    entry_points.stop().await;
}

#[tokio::test]
async fn transports_are_looked_up_by_name() {
    let manager = RoundTripperManager::new();
    assert!(manager.get("").is_ok());
    assert!(matches!(
        manager.get("nope"),
        Err(GatewayError::NotFound(name)) if name == "nope"
    ));
}
