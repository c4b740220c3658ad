use crate::{api::AppState, error::PluginError, sign_api::Registration};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub api_key_set: bool,
    pub user_info: Option<Value>,
}

fn default_country() -> String {
    "DE".into()
}

/// Account sign-up form as submitted by the settings page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterForm {
    #[serde(default)]
    pub product_plan: String,
    #[serde(default)]
    pub organisation: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub house_number: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub clear_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub agb_accepted: bool,
    #[serde(default)]
    pub dsb_accepted: bool,
    #[serde(default)]
    pub vat_id: String,
    #[serde(default)]
    pub coupon_code: String,
}

impl RegisterForm {
    pub fn into_registration(self) -> Registration {
        let non_empty = |s: String| Some(s).filter(|s| !s.is_empty());
        Registration {
            product_plan: self.product_plan,
            organisation: self.organisation,
            street: self.street,
            house_number: self.house_number,
            zip_code: self.zip_code,
            city: self.city,
            country: self.country,
            clear_name: self.clear_name,
            email: self.email,
            password: self.password,
            agb_accepted: self.agb_accepted,
            dsb_accepted: self.dsb_accepted,
            vat_id: non_empty(self.vat_id),
            coupon_code: non_empty(self.coupon_code),
        }
    }
}

fn store_key(state: &AppState, key: &str) -> Result<(), PluginError> {
    state.signd.credentials().set_api_key(key).map_err(|e| {
        error!(error = %e, "failed to store API key");
        PluginError::internal(e, "Failed to save API key")
    })
}

pub async fn get_config(state: &AppState) -> AccountConfig {
    let api_key_set = !state.signd.credentials().api_key().is_empty();
    let mut user_info = None;
    if api_key_set {
        match state.signd.user_info().await {
            Ok(info) => user_info = Some(info),
            Err(e) => warn!(error = %e, "failed to fetch signd user info"),
        }
    }
    AccountConfig {
        api_key_set,
        user_info,
    }
}

/// Validate a pasted API key against signd and store it.
pub async fn save_api_key(state: &AppState, api_key: &str) -> Result<Value, PluginError> {
    let key = api_key.trim();
    if key.is_empty() {
        return Err(PluginError::bad_request("API key cannot be empty"));
    }
    let user_info = state.signd.validate_api_key(key).await.map_err(|e| {
        warn!(error = %e, "signd API key validation failed");
        PluginError::api_with_status(
            e,
            "Invalid API key. Please check the key and try again.",
            StatusCode::UNAUTHORIZED,
        )
    })?;
    store_key(state, key)?;
    info!("signd API key updated");
    Ok(json!({"success": true, "userInfo": user_info}))
}

/// Log in with signd credentials and keep the returned key.
pub async fn login(state: &AppState, email: &str, password: &str) -> Result<Value, PluginError> {
    if email.trim().is_empty() || password.trim().is_empty() {
        return Err(PluginError::bad_request("Email and password are required"));
    }
    let resp = state.signd.login(email, password).await.map_err(|e| {
        warn!(error = %e, "signd login failed");
        PluginError::api_with_status(
            e,
            "Login failed. Please check your credentials.",
            StatusCode::UNAUTHORIZED,
        )
    })?;
    let Some(api_key) = resp.apikey.filter(|k| !k.is_empty()) else {
        return Err(PluginError::rejected(
            StatusCode::UNAUTHORIZED,
            "Login failed: no API key returned",
        ));
    };
    store_key(state, &api_key)?;
    Ok(json!({
        "success": true,
        "userInfo": {
            "email": email,
            "clearName": resp.clear_name,
            "language": resp.language,
        }
    }))
}

/// Create a signd account and keep its key.
pub async fn register(state: &AppState, form: RegisterForm) -> Result<Value, PluginError> {
    if !form.agb_accepted || !form.dsb_accepted {
        return Err(PluginError::bad_request(
            "Terms of service and privacy policy must be accepted",
        ));
    }
    let resp = state
        .signd
        .register_account(&form.into_registration())
        .await
        .map_err(|e| {
            error!(error = %e, "signd registration failed");
            PluginError::api(e, "Registration failed")
        })?;
    let Some(api_key) = resp.api_key.filter(|k| !k.is_empty()) else {
        return Err(PluginError::rejected(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Registration failed: no API key returned",
        ));
    };
    store_key(state, &api_key)?;
    Ok(json!({"success": true, "accountId": resp.account_id}))
}

pub fn delete_api_key(state: &AppState) -> Result<Value, PluginError> {
    store_key(state, "")?;
    info!("signd API key removed");
    Ok(json!({"success": true}))
}

pub async fn prices(state: &AppState) -> Result<Value, PluginError> {
    state
        .signd
        .prices()
        .await
        .map_err(|e| {
            error!(error = %e, "failed to fetch signd prices");
            PluginError::api(e, "Failed to fetch pricing information")
        })
}

/// Check the stored key. Never fails; the outcome is in the body.
pub async fn validate(state: &AppState) -> Value {
    if state.signd.credentials().api_key().is_empty() {
        return json!({"valid": false, "error": "No API key configured"});
    }
    match state.signd.user_info().await {
        Ok(info) => json!({"valid": true, "userInfo": info}),
        Err(_) => json!({"valid": false, "error": "API key is invalid or expired"}),
    }
}
