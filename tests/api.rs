#![cfg(unix)]

use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    num::NonZeroU32,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode, header},
    routing::get,
};
use folio::{
    application::{
        convert::Converter,
        notify::{NotificationQueue, Notifier, NotifyError},
    },
    config::{ConvertSettings, EngineSettings},
    infra::http::{ClientIpSource, HttpState, apply_middleware, build_router},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const COPY_ENGINE: &str = r#"#!/bin/sh
in="$1"
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
  esac
done
cat "$in" > "$out"
"#;

const FAILING_ENGINE: &str = "#!/bin/sh\necho boom >&2\nexit 1\n";

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, message: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier lock")
            .push((subject.to_string(), message.to_string()));
        Ok(())
    }
}

struct TestApp {
    _dir: TempDir,
    temp_root: PathBuf,
    notifier: Arc<RecordingNotifier>,
    notifications: NotificationQueue,
    router: Router,
}

impl TestApp {
    fn new(engine_script: &str) -> Self {
        Self::build(engine_script, 1024 * 1024, ClientIpSource::Peer)
    }

    fn with_body_limit(engine_script: &str, max_request_bytes: usize) -> Self {
        Self::build(engine_script, max_request_bytes, ClientIpSource::Peer)
    }

    fn with_client_ip(client_ip: ClientIpSource) -> Self {
        Self::build(COPY_ENGINE, 1024 * 1024, client_ip)
    }

    fn build(engine_script: &str, max_request_bytes: usize, client_ip: ClientIpSource) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let engine = dir.path().join("fake-pandoc");
        fs::write(&engine, engine_script).expect("write engine");
        let mut perms = fs::metadata(&engine).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&engine, perms).expect("chmod engine");

        let temp_root = dir.path().join("work");
        fs::create_dir(&temp_root).expect("work dir");

        let converter = Converter::new(
            EngineSettings {
                path: engine,
                data_dir: PathBuf::from("/.pandoc"),
                command_timeout: Duration::from_secs(10),
                temp_dir: temp_root.clone(),
            },
            &ConvertSettings {
                max_concurrent: NonZeroU32::new(4).expect("non-zero"),
                max_resources: NonZeroU32::new(8).expect("non-zero"),
            },
        );

        let notifier = Arc::new(RecordingNotifier::default());
        let (notifications, _worker) =
            NotificationQueue::spawn(notifier.clone(), 16, Duration::from_secs(1));

        let router = build_router(
            HttpState {
                converter: Arc::new(converter),
                notifications: notifications.clone(),
                client_ip,
            },
            max_request_bytes,
        );

        Self {
            _dir: dir,
            temp_root,
            notifier,
            notifications,
            router,
        }
    }

    async fn post_convert(&self, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/convert")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request should build"),
        )
        .await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should collect")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    /// Give the notification worker a chance to drain.
    async fn settle(&self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn find_named(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(find_named(&path, name));
        } else if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            found.push(path);
        }
    }
    found
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log lock")).into_owned()
    }
}

#[tokio::test]
async fn convert_returns_engine_output() {
    let app = TestApp::new(COPY_ENGINE);

    let (status, body) = app
        .post_convert(json!({"input": "IyBIZWxsbw==", "template": "default"}))
        .await;

    assert_eq!(status, StatusCode::OK);
    // "# Hello" copied verbatim by the stub engine.
    assert_eq!(body, json!({"content": "IyBIZWxsbw=="}));
    assert_eq!(fs::read_dir(&app.temp_root).expect("read").count(), 0);
}

#[tokio::test]
async fn traversal_resource_is_rejected_without_writes() {
    let app = TestApp::new(COPY_ENGINE);

    let (status, body) = app
        .post_convert(json!({
            "input": "IyBIZWxsbw==",
            "resources": {"../secret.txt": "eA=="},
            "template": "default"
        }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "invalid resource path"}));
    let scan_root = app.temp_root.parent().expect("temp root parent");
    assert!(find_named(scan_root, "secret.txt").is_empty());
    assert_eq!(fs::read_dir(&app.temp_root).expect("read").count(), 0);
}

#[tokio::test]
async fn missing_template_is_invalid_input() {
    let app = TestApp::new(COPY_ENGINE);

    let (status, body) = app.post_convert(json!({"input": "IyBIZWxsbw=="})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "invalid input"}));
}

#[tokio::test]
async fn missing_input_and_malformed_bodies_are_invalid_input() {
    let app = TestApp::new(COPY_ENGINE);

    let (status, body) = app.post_convert(json!({"template": "default"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "invalid input"}));

    let (status, body) = app
        .post_convert(json!({"input": "not base64!", "template": "default"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "invalid input"}));

    let (status, body) = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/convert")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .expect("request should build"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "invalid input"}));
}

#[tokio::test]
async fn engine_failure_is_generic_500_and_logged() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let app = TestApp::new(FAILING_ENGINE);
    let (status, body) = app
        .post_convert(json!({"input": "IyBIZWxsbw==", "template": "default"}))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "error converting markdown"}));
    assert!(!body.to_string().contains("boom"));
    assert!(logs.contents().contains("boom"), "log: {}", logs.contents());

    app.settle().await;
    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.contains("500"));
    assert!(sent[0].1.contains("boom"));
}

#[tokio::test]
async fn client_errors_do_not_notify() {
    let app = TestApp::new(COPY_ENGINE);
    let (status, _) = app.post_convert(json!({"input": "IyBIZWxsbw=="})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.settle().await;
    assert!(app.notifier.sent().is_empty());
}

#[tokio::test]
async fn health_returns_no_content() {
    let app = TestApp::new(COPY_ENGINE);
    let (status, body) = app
        .send(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let app = TestApp::new(COPY_ENGINE);
    let (status, body) = app
        .send(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "page not found"}));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let app = TestApp::with_body_limit(COPY_ENGINE, 64);
    let big = "A".repeat(256);
    let (status, _) = app
        .post_convert(json!({"input": big, "template": "default"}))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn panics_become_500_and_notify() {
    let app = TestApp::new(COPY_ENGINE);
    let router = apply_middleware(
        Router::new().route(
            "/boom",
            get(|| async {
                if true {
                    panic!("handler exploded");
                }
                "unreachable"
            }),
        ),
        app.notifications.clone(),
        ClientIpSource::Peer,
    );

    let response = router
        .oneshot(
            Request::builder()
                .uri("/boom")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(body, json!({"error": "internal server error"}));

    app.settle().await;
    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("handler exploded"));
}

#[tokio::test]
async fn resource_clashes_are_client_errors_without_notification() {
    let app = TestApp::new(COPY_ENGINE);

    for resources in [
        json!({"a": "eA==", "a/b": "eA=="}),
        json!({"output": "eA=="}),
    ] {
        let (status, body) = app
            .post_convert(json!({
                "input": "IyBIZWxsbw==",
                "resources": resources.clone(),
                "template": "default"
            }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{resources}");
        assert!(body["error"].is_string());
    }

    app.settle().await;
    assert!(app.notifier.sent().is_empty());
    assert_eq!(fs::read_dir(&app.temp_root).expect("read").count(), 0);
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let app = TestApp::new(COPY_ENGINE);

    for uri in ["/health", "/nope"] {
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("router should respond");
        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff", "{uri}");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN", "{uri}");
        assert_eq!(headers[header::X_XSS_PROTECTION], "1; mode=block", "{uri}");
    }
}

fn health_from(peer: &str, cloudflare_ip: &str) -> Request<Body> {
    let mut request = Request::builder()
        .uri("/health")
        .header(header::USER_AGENT, "folio-test/1.0")
        .header("CF-Connecting-IP", cloudflare_ip)
        .body(Body::empty())
        .expect("request should build");
    let peer: SocketAddr = peer.parse().expect("peer addr");
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

#[tokio::test]
async fn access_log_uses_cloudflare_address_when_enabled() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let app = TestApp::with_client_ip(ClientIpSource::Cloudflare);
    let (status, _) = app.send(health_from("10.0.0.1:4000", "203.0.113.7")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let contents = logs.contents();
    assert!(contents.contains("client_ip=203.0.113.7"), "log: {contents}");
    assert!(contents.contains("folio-test/1.0"), "log: {contents}");
}

#[tokio::test]
async fn access_log_ignores_cloudflare_header_by_default() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let app = TestApp::new(COPY_ENGINE);
    let (status, _) = app.send(health_from("10.0.0.1:4000", "203.0.113.7")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let contents = logs.contents();
    assert!(contents.contains("client_ip=10.0.0.1"), "log: {contents}");
    assert!(!contents.contains("203.0.113.7"), "log: {contents}");
}
