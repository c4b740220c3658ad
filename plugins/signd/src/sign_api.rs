use crate::settings::Credentials;
use bytes::Bytes;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

/// Failure talking to the signd API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("signd unreachable: {0}")]
    Unreachable(String),
    #[error("signd rejected request ({status}): {body}")]
    Client { status: StatusCode, body: String },
    #[error("signd server error ({status}): {body}")]
    Server { status: StatusCode, body: String },
    #[error("invalid signd response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() || e.is_body() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Unreachable(e.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub apikey: Option<String>,
    #[serde(rename = "clearName")]
    pub clear_name: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub api_key: Option<String>,
    pub account_id: Option<Value>,
}

/// Account registration request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub product_plan: String,
    pub organisation: String,
    pub street: String,
    pub house_number: String,
    pub zip_code: String,
    pub city: String,
    pub country: String,
    pub clear_name: String,
    pub email: String,
    pub password: String,
    pub agb_accepted: bool,
    pub dsb_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMetaData {
    pub host_file_id: String,
    pub host_file_path: String,
    pub host_file_name: String,
    pub host_user_id: String,
    pub host_instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiClientMetaData {
    pub application_name: String,
    pub application_meta_data: ApplicationMetaData,
}

/// Payload of `start-wizard`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWizard {
    pub pdf_filename: String,
    /// Base64 encoded PDF.
    pub pdf_data: String,
    pub name: String,
    pub api_client_meta_data: ApiClientMetaData,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartWizardResponse {
    pub process_id: Option<String>,
    pub wizard_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResumeWizardResponse {
    pub wizard_url: Option<String>,
}

/// An unfinished wizard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub draft_id: Option<Value>,
    pub name: Option<String>,
    pub created: Option<Value>,
    pub filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaPayload {
    #[serde(default)]
    drafts: Option<Vec<Draft>>,
    #[serde(default)]
    processes: Option<Vec<Value>>,
}

/// What signd knows about a process id.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMeta {
    Neither,
    Draft(Draft),
    Processes(Vec<Value>),
    DraftAndProcesses(Draft, Vec<Value>),
}

impl FileMeta {
    pub fn first_process(&self) -> Option<&Value> {
        match self {
            FileMeta::Processes(p) | FileMeta::DraftAndProcesses(_, p) => p.first(),
            FileMeta::Neither | FileMeta::Draft(_) => None,
        }
    }
}

impl From<MetaPayload> for FileMeta {
    fn from(meta: MetaPayload) -> Self {
        let draft = meta.drafts.and_then(|d| d.into_iter().next());
        let processes = meta.processes.filter(|p| !p.is_empty());
        match (draft, processes) {
            (None, None) => FileMeta::Neither,
            (Some(d), None) => FileMeta::Draft(d),
            (None, Some(p)) => FileMeta::Processes(p),
            (Some(d), Some(p)) => FileMeta::DraftAndProcesses(d, p),
        }
    }
}

fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let value: Option<T> =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(value.unwrap_or_default())
}

fn decode_value(body: &[u8]) -> Result<Value, ApiError> {
    let value: Value = decode(body)?;
    Ok(if value.is_null() { json!({}) } else { value })
}

/// Client for the signd HTTP API.
#[derive(Clone)]
pub struct SignApiClient {
    http: Client,
    credentials: Credentials,
}

impl SignApiClient {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            http: Client::new(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.credentials.api_url(), endpoint)
    }

    async fn execute(&self, endpoint: &str, req: RequestBuilder) -> Result<Bytes, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if status.is_client_error() {
            return Err(ApiError::Client {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if status.is_server_error() {
            return Err(ApiError::Server {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        tracing::trace!(endpoint, len = body.len(), "signd response");
        Ok(body)
    }

    async fn get_raw(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Bytes, ApiError> {
        let mut req = self
            .http
            .get(self.url(endpoint))
            .header("X-API-KEY", self.credentials.api_key())
            .header(header::ACCEPT, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        self.execute(endpoint, req).await.map_err(|e| {
            error!(endpoint, error = %e, "signd API GET request failed");
            e
        })
    }

    async fn get<T: DeserializeOwned + Default>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        decode(&self.get_raw(endpoint, query).await?)
    }

    async fn post_raw<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        with_api_key: bool,
    ) -> Result<Bytes, ApiError> {
        let payload = serde_json::to_vec(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let mut req = self
            .http
            .post(self.url(endpoint))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(payload);
        if with_api_key {
            req = req.header("X-API-KEY", self.credentials.api_key());
        }
        self.execute(endpoint, req).await.map_err(|e| {
            error!(endpoint, error = %e, "signd API POST request failed");
            e
        })
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned + Default>(
        &self,
        endpoint: &str,
        body: &B,
        with_api_key: bool,
    ) -> Result<T, ApiError> {
        decode(&self.post_raw(endpoint, body, with_api_key).await?)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        self.post(
            "/api/v2/api-login",
            &json!({"email": email, "password": password}),
            false,
        )
        .await
    }

    pub async fn register_account(
        &self,
        registration: &Registration,
    ) -> Result<RegisterResponse, ApiError> {
        self.post("/api/register-account", registration, false).await
    }

    pub async fn prices(&self) -> Result<Value, ApiError> {
        decode_value(&self.post_raw("/api/prices", &json!({}), false).await?)
    }

    pub async fn user_info(&self) -> Result<Value, ApiError> {
        decode_value(&self.get_raw("/api/user-info", &[]).await?)
    }

    /// Call `user-info` with a candidate key instead of the stored one.
    pub async fn validate_api_key(&self, api_key: &str) -> Result<Value, ApiError> {
        let req = self
            .http
            .get(self.url("/api/user-info"))
            .header("X-API-KEY", api_key)
            .header(header::ACCEPT, "application/json");
        decode_value(&self.execute("/api/user-info", req).await?)
    }

    pub async fn start_wizard(&self, data: &StartWizard) -> Result<StartWizardResponse, ApiError> {
        self.post("/api/start-wizard", data, true).await
    }

    pub async fn resume_wizard(&self, id: &str) -> Result<ResumeWizardResponse, ApiError> {
        self.post("/api/resume-wizard", &json!({"id": id}), true)
            .await
    }

    pub async fn cancel_wizard(&self, id: &str) -> Result<(), ApiError> {
        self.post_raw("/api/cancel-wizard", &json!({"id": id}), true)
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, id: &str) -> Result<FileMeta, ApiError> {
        let meta: MetaPayload = self.get("/api/get-meta", &[("id", id.to_string())]).await?;
        Ok(meta.into())
    }

    pub async fn list_processes(&self, params: &[(&str, String)]) -> Result<Value, ApiError> {
        decode_value(&self.get_raw("/api/list", params).await?)
    }

    pub async fn list_status(&self, params: &[(&str, String)]) -> Result<Value, ApiError> {
        decode_value(&self.get_raw("/api/list-status", params).await?)
    }

    /// Raw bytes of the signed PDF.
    pub async fn finished_pdf(&self, id: &str) -> Result<Bytes, ApiError> {
        let req = self
            .http
            .get(self.url("/api/finished"))
            .query(&[("id", id)])
            .header("X-API-KEY", self.credentials.api_key());
        self.execute("/api/finished", req).await
    }

    pub async fn new_finished(&self, gt: &str) -> Result<Value, ApiError> {
        decode_value(&self.get_raw("/api/new-finished", &[("gt", gt.to_string())]).await?)
    }

    pub async fn cancel_process(&self, id: &str, reason: &str) -> Result<(), ApiError> {
        self.post_raw(
            "/api/cancel-process",
            &json!({"id": id, "reason": reason}),
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn resume_process(&self, id: &str) -> Result<(), ApiError> {
        self.post_raw("/api/resume-process", &json!({"id": id}), true)
            .await?;
        Ok(())
    }

    /// Find processes whose original document matches this PDF.
    pub async fn find_by_original(&self, pdf: Bytes) -> Result<Value, ApiError> {
        let req = self
            .http
            .post(self.url("/api/find-by-original"))
            .header("X-API-KEY", self.credentials.api_key())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(pdf);
        decode_value(&self.execute("/api/find-by-original", req).await?)
    }
}
