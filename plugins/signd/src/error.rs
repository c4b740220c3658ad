use crate::sign_api::ApiError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

/// JSON error body returned to the host UI.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorResp {
    pub error: String,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Translate a signd failure into the response shown to the user.
pub fn api_error_response(
    e: &ApiError,
    fallback: &str,
    fallback_status: StatusCode,
) -> (StatusCode, ErrorResp) {
    match e {
        ApiError::Unreachable(_) => (
            StatusCode::BAD_GATEWAY,
            ErrorResp {
                error: "Cannot reach signd.it server".into(),
                error_code: Some("SIGND_UNREACHABLE".into()),
            },
        ),
        ApiError::Client { status, body } => {
            let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
                v.get("error").map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            });
            let message = from_json.unwrap_or_else(|| {
                if body.is_empty() {
                    fallback.to_string()
                } else {
                    body.clone()
                }
            });
            let code = if matches!(*status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                "SIGND_UNAUTHORIZED"
            } else {
                "SIGND_API_ERROR"
            };
            (
                *status,
                ErrorResp {
                    error: message,
                    error_code: Some(code.into()),
                },
            )
        }
        ApiError::Server { .. } | ApiError::Decode(_) => unknown(fallback, fallback_status),
    }
}

fn unknown(fallback: &str, status: StatusCode) -> (StatusCode, ErrorResp) {
    (
        status,
        ErrorResp {
            error: fallback.to_string(),
            error_code: Some("SIGND_UNKNOWN_ERROR".into()),
        },
    )
}

/// Error returned by plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A deliberate refusal with a fixed status and message.
    #[error("{message}")]
    Rejected {
        status: StatusCode,
        message: String,
        code: Option<&'static str>,
    },
    #[error("{fallback}: {source}")]
    Api {
        source: ApiError,
        fallback: &'static str,
        fallback_status: StatusCode,
    },
    #[error("{fallback}: {source}")]
    Internal {
        source: anyhow::Error,
        fallback: &'static str,
    },
}

impl PluginError {
    pub fn rejected(status: StatusCode, message: &str) -> Self {
        PluginError::Rejected {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::rejected(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::rejected(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthenticated() -> Self {
        Self::rejected(StatusCode::UNAUTHORIZED, "Not authenticated")
    }

    pub fn api(source: ApiError, fallback: &'static str) -> Self {
        Self::api_with_status(source, fallback, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn api_with_status(
        source: ApiError,
        fallback: &'static str,
        fallback_status: StatusCode,
    ) -> Self {
        PluginError::Api {
            source,
            fallback,
            fallback_status,
        }
    }

    pub fn internal<E: Into<anyhow::Error>>(source: E, fallback: &'static str) -> Self {
        PluginError::Internal {
            source: source.into(),
            fallback,
        }
    }

    /// Status and body this error is reported with.
    pub fn to_parts(&self) -> (StatusCode, ErrorResp) {
        match self {
            PluginError::Rejected {
                status,
                message,
                code,
            } => (
                *status,
                ErrorResp {
                    error: message.clone(),
                    error_code: code.map(str::to_string),
                },
            ),
            PluginError::Api {
                source,
                fallback,
                fallback_status,
            } => api_error_response(source, fallback, *fallback_status),
            PluginError::Internal { fallback, .. } => {
                unknown(fallback, StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let (status, body) = self.to_parts();
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(status: u16, body: &str) -> ApiError {
        ApiError::Client {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.into(),
        }
    }

    #[test]
    fn unreachable_maps_to_bad_gateway() {
        let (status, body) = api_error_response(
            &ApiError::Unreachable("connection refused".into()),
            "Something failed",
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.error, "Cannot reach signd.it server");
        assert_eq!(body.error_code.as_deref(), Some("SIGND_UNREACHABLE"));
    }

    #[test]
    fn client_error_uses_json_message() {
        let (status, body) = api_error_response(
            &client(422, r#"{"error":"PDF is encrypted"}"#),
            "fallback",
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.error, "PDF is encrypted");
        assert_eq!(body.error_code.as_deref(), Some("SIGND_API_ERROR"));
    }

    #[test]
    fn client_error_falls_back_to_raw_body_then_message() {
        let (_, body) = api_error_response(
            &client(400, "plain failure"),
            "fallback",
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_eq!(body.error, "plain failure");
        let (_, body) =
            api_error_response(&client(400, ""), "fallback", StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "fallback");
    }

    #[test]
    fn auth_failures_are_flagged() {
        for code in [401, 403] {
            let (status, body) =
                api_error_response(&client(code, "{}"), "x", StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(status.as_u16(), code);
            assert_eq!(body.error_code.as_deref(), Some("SIGND_UNAUTHORIZED"));
        }
    }

    #[test]
    fn other_failures_use_fallback() {
        let err = PluginError::api_with_status(
            ApiError::Server {
                status: StatusCode::BAD_GATEWAY,
                body: "oops".into(),
            },
            "Login failed",
            StatusCode::UNAUTHORIZED,
        );
        let (status, body) = err.to_parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, "Login failed");
        assert_eq!(body.error_code.as_deref(), Some("SIGND_UNKNOWN_ERROR"));

        let (status, body) =
            PluginError::internal(anyhow::anyhow!("disk"), "Failed to load processes").to_parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Failed to load processes");
    }
}
