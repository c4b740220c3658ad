use crate::{
    account::{self, RegisterForm},
    config::Config,
    db::{self, DbPool},
    error::PluginError,
    overview::{self, OverviewQuery},
    processes::ProcessRepo,
    settings::{Credentials, SqliteSettings},
    sign_api::SignApiClient,
    signing,
    storage::{DiskStorage, FileStorage},
};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

/// Header carrying the id of the host user a request is made for.
pub const USER_HEADER: &str = "x-host-user";
/// Header set by the host when that user is an administrator.
pub const ADMIN_HEADER: &str = "x-host-admin";

#[derive(Clone)]
pub struct AppState {
    pub processes: ProcessRepo,
    pub signd: SignApiClient,
    pub storage: Arc<dyn FileStorage>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let pool = db::open_pool(config.db_path())?;
        let storage = DiskStorage::new(config.storage_root.clone(), pool.clone())?;
        let nodes = storage.index()?;
        info!(nodes, root = %config.storage_root.display(), "storage indexed");
        Ok(Self::with_storage(config, pool, Arc::new(storage)))
    }

    /// Assemble the state around an existing pool and storage backend.
    pub fn with_storage(config: Config, pool: DbPool, storage: Arc<dyn FileStorage>) -> Self {
        let credentials = Credentials::new(Arc::new(SqliteSettings::new(pool.clone())));
        Self {
            processes: ProcessRepo::new(pool.clone()),
            signd: SignApiClient::new(credentials),
            storage,
            config,
        }
    }
}

/// The user the host says this request is for, if any.
pub struct HostUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for HostUser {
    type Rejection = PluginError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        host_user(&parts.headers)
            .map(HostUser)
            .ok_or_else(PluginError::unauthenticated)
    }
}

fn host_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn admin_middleware<B>(req: Request<B>, next: Next<B>) -> Response {
    let is_admin = req
        .headers()
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !is_admin {
        return PluginError::rejected(StatusCode::FORBIDDEN, "Admin access required")
            .into_response();
    }
    next.run(req).await
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let settings = Router::new()
        .route("/settings/config", get(settings_config))
        .route("/settings/api-key", post(save_api_key).delete(delete_api_key))
        .route("/settings/login", post(login))
        .route("/settings/register", post(register))
        .route("/settings/prices", get(prices))
        .route("/settings/validate", get(validate))
        .layer(middleware::from_fn(admin_middleware));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/overview", get(overview_list))
        .route("/api/overview/:process_id/cancel", post(overview_cancel))
        .route("/api/files/:file_id/processes", get(file_processes))
        .route("/api/files/:file_id/start-wizard", post(start_wizard))
        .route("/api/processes/:process_id/refresh", post(refresh))
        .route("/api/processes/:process_id/resume-wizard", post(resume_wizard))
        .route("/api/processes/:process_id/cancel-wizard", post(cancel_wizard))
        .route("/api/processes/:process_id/download", get(download))
        .merge(settings)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn ok() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn settings_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(account::get_config(&state).await)
}

#[derive(Deserialize)]
struct ApiKeyReq {
    #[serde(default, rename = "apiKey")]
    api_key: String,
}

async fn save_api_key(
    State(state): State<AppState>,
    Json(req): Json<ApiKeyReq>,
) -> Result<Json<Value>, PluginError> {
    account::save_api_key(&state, &req.api_key).await.map(Json)
}

async fn delete_api_key(State(state): State<AppState>) -> Result<Json<Value>, PluginError> {
    account::delete_api_key(&state).map(Json)
}

#[derive(Deserialize)]
struct LoginReq {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<Value>, PluginError> {
    account::login(&state, &req.email, &req.password).await.map(Json)
}

async fn register(
    State(state): State<AppState>,
    Json(form): Json<RegisterForm>,
) -> Result<Json<Value>, PluginError> {
    account::register(&state, form).await.map(Json)
}

async fn prices(State(state): State<AppState>) -> Result<Json<Value>, PluginError> {
    account::prices(&state).await.map(Json)
}

async fn validate(State(state): State<AppState>) -> Json<Value> {
    Json(account::validate(&state).await)
}

async fn overview_list(
    State(state): State<AppState>,
    user: Option<HostUser>,
    Query(query): Query<OverviewQuery>,
) -> Result<Json<Value>, PluginError> {
    let user = user.map(|HostUser(u)| u);
    overview::list(&state, user.as_deref(), &query).await.map(Json)
}

#[derive(Deserialize)]
struct CancelReq {
    #[serde(default)]
    reason: String,
}

async fn overview_cancel(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
    body: Option<Json<CancelReq>>,
) -> Result<Json<Value>, PluginError> {
    let reason = body.map(|Json(req)| req.reason).unwrap_or_default();
    overview::cancel(&state, &process_id, &reason).await?;
    Ok(ok())
}

async fn file_processes(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<impl IntoResponse, PluginError> {
    let processes = signing::list_for_file(&state, file_id).await?;
    Ok(Json(processes))
}

async fn start_wizard(
    State(state): State<AppState>,
    user: Option<HostUser>,
    Path(file_id): Path<i64>,
) -> Result<impl IntoResponse, PluginError> {
    let user = user.map(|HostUser(u)| u);
    let started = signing::start_wizard(&state, user.as_deref(), file_id).await?;
    Ok(Json(started))
}

async fn refresh(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
) -> Result<impl IntoResponse, PluginError> {
    let view = signing::refresh(&state, &process_id).await?;
    Ok(Json(view))
}

async fn resume_wizard(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
) -> Result<Json<Value>, PluginError> {
    let wizard_url = signing::resume_wizard(&state, &process_id).await?;
    Ok(Json(json!({"wizardUrl": wizard_url})))
}

async fn cancel_wizard(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
) -> Result<Json<Value>, PluginError> {
    signing::cancel_wizard(&state, &process_id).await?;
    Ok(ok())
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    filename: String,
}

async fn download(
    State(state): State<AppState>,
    user: Option<HostUser>,
    Path(process_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, PluginError> {
    let user = user.map(|HostUser(u)| u);
    let result = signing::download(&state, user.as_deref(), &process_id, &query.filename).await?;
    Ok(Json(result))
}

pub async fn run_http_server(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.bind.parse()?;
    info!(%addr, "signd plugin listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
