#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use signd::{
    api::{build_router, AppState},
    config::Config,
    storage::Node,
};
use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;

pub const GOOD_KEY: &str = "good-key";
pub const SIGNED_PDF: &[u8] = b"%PDF-1.7 signed";

/// What the fake signd server has seen and will answer.
#[derive(Default)]
pub struct FakeSignd {
    pub calls: Mutex<Vec<(String, String)>>,
    pub start_body: Mutex<Option<Value>>,
    pub list_query: Mutex<HashMap<String, String>>,
    pub meta: Mutex<Value>,
    pub list: Mutex<Value>,
}

impl FakeSignd {
    pub fn count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|(p, _)| p == path).count()
    }

    fn record(&self, path: &str, headers: &HeaderMap) {
        let key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.calls.lock().push((path.to_string(), key));
    }
}

type Fake = State<Arc<FakeSignd>>;

async fn start_wizard(State(f): Fake, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    f.record("/api/start-wizard", &headers);
    *f.start_body.lock() = Some(body);
    Json(json!({"processId": "proc-1234567890", "wizardUrl": "https://signd.test/wizard/1"}))
}

async fn get_meta(State(f): Fake, headers: HeaderMap) -> Json<Value> {
    f.record("/api/get-meta", &headers);
    Json(f.meta.lock().clone())
}

async fn finished(State(f): Fake, headers: HeaderMap) -> Vec<u8> {
    f.record("/api/finished", &headers);
    SIGNED_PDF.to_vec()
}

async fn resume_wizard(State(f): Fake, headers: HeaderMap) -> Json<Value> {
    f.record("/api/resume-wizard", &headers);
    Json(json!({"wizardUrl": "https://signd.test/wizard/resumed"}))
}

async fn cancel_wizard(State(f): Fake, headers: HeaderMap) -> StatusCode {
    f.record("/api/cancel-wizard", &headers);
    StatusCode::OK
}

async fn cancel_process(State(f): Fake, headers: HeaderMap) -> StatusCode {
    f.record("/api/cancel-process", &headers);
    StatusCode::OK
}

async fn list(
    State(f): Fake,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    f.record("/api/list", &headers);
    *f.list_query.lock() = query;
    Json(f.list.lock().clone())
}

async fn user_info(State(f): Fake, headers: HeaderMap) -> impl IntoResponse {
    f.record("/api/user-info", &headers);
    let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if key == Some(GOOD_KEY) {
        (StatusCode::OK, Json(json!({"email": "alice@example.com"})))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid API key"})),
        )
    }
}

async fn login(State(f): Fake, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    f.record("/api/v2/api-login", &headers);
    if body["password"] == "secret" {
        (
            StatusCode::OK,
            Json(json!({"apikey": GOOD_KEY, "clearName": "Alice", "language": "de"})),
        )
    } else {
        (StatusCode::OK, Json(json!({})))
    }
}

async fn list_status(
    State(f): Fake,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    f.record("/api/list-status", &headers);
    Json(json!({"processes": [], "status": query.get("status")}))
}

async fn new_finished(
    State(f): Fake,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    f.record("/api/new-finished", &headers);
    Json(json!({"gt": query.get("gt"), "processes": [{"processId": "proc-1"}]}))
}

async fn resume_process(State(f): Fake, headers: HeaderMap) -> StatusCode {
    f.record("/api/resume-process", &headers);
    StatusCode::NO_CONTENT
}

async fn find_by_original(State(f): Fake, headers: HeaderMap, body: Bytes) -> Json<Value> {
    f.record("/api/find-by-original", &headers);
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({"size": body.len(), "contentType": content_type}))
}

async fn prices(State(f): Fake, headers: HeaderMap) -> StatusCode {
    f.record("/api/prices", &headers);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server)
}

/// Start a fake signd API on an ephemeral port.
pub fn spawn_fake_signd() -> (String, Arc<FakeSignd>) {
    let fake = Arc::new(FakeSignd::default());
    *fake.meta.lock() = json!({});
    *fake.list.lock() = json!({"processes": []});
    let app = Router::new()
        .route("/api/start-wizard", post(start_wizard))
        .route("/api/get-meta", get(get_meta))
        .route("/api/finished", get(finished))
        .route("/api/resume-wizard", post(resume_wizard))
        .route("/api/cancel-wizard", post(cancel_wizard))
        .route("/api/cancel-process", post(cancel_process))
        .route("/api/list", get(list))
        .route("/api/user-info", get(user_info))
        .route("/api/v2/api-login", post(login))
        .route("/api/prices", post(prices))
        .route("/api/list-status", get(list_status))
        .route("/api/new-finished", get(new_finished))
        .route("/api/resume-process", post(resume_process))
        .route("/api/find-by-original", post(find_by_original))
        .with_state(fake.clone());
    let (addr, _server) = serve(app);
    (format!("http://{addr}"), fake)
}

/// A URL nothing listens on.
pub fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub struct Plugin {
    pub base: String,
    pub state: AppState,
    pub client: reqwest::Client,
    pub tmp: tempfile::TempDir,
    server: JoinHandle<()>,
}

impl Plugin {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Put a file into alice's folder.
    pub fn add_file(&self, name: &str) -> Node {
        let folder = self.state.storage.user_folder("alice").unwrap();
        self.state
            .storage
            .new_file(&folder, name, b"%PDF-1.4 original")
            .unwrap()
    }

    pub fn disk_path(&self, host_path: &str) -> std::path::PathBuf {
        self.tmp
            .path()
            .join("storage")
            .join(host_path.trim_start_matches('/'))
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn test_config(tmp: &tempfile::TempDir, bind: String) -> Config {
    Config {
        bind,
        data_dir: tmp.path().join("data"),
        storage_root: tmp.path().join("storage"),
        instance_id: "test-instance".into(),
        cleanup_interval: Duration::from_secs(86_400),
        logging_enabled: true,
    }
}

/// Start the plugin's router against the given signd URL.
pub fn spawn_plugin(signd_url: &str) -> Plugin {
    let tmp = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let state = AppState::new(test_config(&tmp, addr.to_string())).unwrap();
    state.signd.credentials().set_api_url(signd_url).unwrap();
    state.signd.credentials().set_api_key(GOOD_KEY).unwrap();
    let (addr, server) = serve(build_router(state.clone()));
    Plugin {
        base: format!("http://{addr}"),
        state,
        client: reqwest::Client::new(),
        tmp,
        server,
    }
}

/// Captures log output of the current thread.
#[derive(Clone, Default)]
pub struct LogBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuf {
    type Writer = LogBuf;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogBuf {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}
