use crate::db::DbPool;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

pub const DEFAULT_API_URL: &str = "https://signd.it";
pub const API_URL_ENV: &str = "SIGND_BASE_URL";

const KEY_API_URL: &str = "api_url";
const KEY_API_KEY: &str = "api_key";

/// Key/value configuration owned by the host on behalf of the plugin.
pub trait SettingsStore: Send + Sync {
    fn get_value(&self, key: &str) -> Result<Option<String>>;
    fn set_value(&self, key: &str, value: &str) -> Result<()>;
    fn delete_value(&self, key: &str) -> Result<()>;
}

/// Settings persisted in the plugin database.
#[derive(Clone)]
pub struct SqliteSettings {
    pool: DbPool,
}

impl SqliteSettings {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl SettingsStore for SqliteSettings {
    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM app_settings WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Pick the API base URL: explicit setting, then environment, then default.
pub fn resolve_api_url(explicit: Option<&str>, env: Option<&str>) -> String {
    [explicit, env]
        .into_iter()
        .flatten()
        .find(|v| !v.is_empty())
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

/// Typed view over the plugin's settings.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn SettingsStore>,
}

impl Credentials {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub fn api_url(&self) -> String {
        let explicit = self.store.get_value(KEY_API_URL).ok().flatten();
        let env = std::env::var(API_URL_ENV).ok();
        resolve_api_url(explicit.as_deref(), env.as_deref())
    }

    pub fn set_api_url(&self, url: &str) -> Result<()> {
        self.store.set_value(KEY_API_URL, url)
    }

    /// Forget the stored URL so the environment or default applies again.
    pub fn reset_api_url(&self) -> Result<()> {
        self.store.delete_value(KEY_API_URL)
    }

    /// The stored API key, empty when none is configured.
    pub fn api_key(&self) -> String {
        self.store
            .get_value(KEY_API_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn set_api_key(&self, key: &str) -> Result<()> {
        self.store.set_value(KEY_API_KEY, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serial_test::serial;

    fn settings() -> (tempfile::TempDir, Credentials) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::open_pool(dir.path().join("s.db")).unwrap();
        (dir, Credentials::new(Arc::new(SqliteSettings::new(pool))))
    }

    #[test]
    fn explicit_url_wins_and_is_trimmed() {
        assert_eq!(
            resolve_api_url(Some("https://custom.signd.it/"), Some("http://localhost:7755")),
            "https://custom.signd.it"
        );
    }

    #[test]
    fn env_url_used_when_no_setting() {
        assert_eq!(
            resolve_api_url(Some(""), Some("http://localhost:7755/")),
            "http://localhost:7755"
        );
        assert_eq!(
            resolve_api_url(None, Some("http://localhost:7755")),
            "http://localhost:7755"
        );
    }

    #[test]
    fn default_url_when_nothing_configured() {
        assert_eq!(resolve_api_url(None, None), DEFAULT_API_URL);
        assert_eq!(resolve_api_url(Some(""), Some("")), DEFAULT_API_URL);
    }

    #[test]
    #[serial]
    fn stored_values_roundtrip() {
        std::env::remove_var(API_URL_ENV);
        let (_dir, creds) = settings();
        assert_eq!(creds.api_key(), "");
        assert_eq!(creds.api_url(), DEFAULT_API_URL);

        creds.set_api_key("k-1").unwrap();
        creds.set_api_key("k-2").unwrap();
        creds.set_api_url("http://127.0.0.1:9/").unwrap();
        assert_eq!(creds.api_key(), "k-2");
        assert_eq!(creds.api_url(), "http://127.0.0.1:9");

        creds.reset_api_url().unwrap();
        assert_eq!(creds.api_url(), DEFAULT_API_URL);
        creds.reset_api_url().unwrap();
    }

    #[test]
    #[serial]
    fn env_url_applies_without_stored_url() {
        std::env::set_var(API_URL_ENV, "http://localhost:7755/");
        let (_dir, creds) = settings();
        assert_eq!(creds.api_url(), "http://localhost:7755");
        creds.set_api_url("https://custom.signd.it").unwrap();
        assert_eq!(creds.api_url(), "https://custom.signd.it");
        std::env::remove_var(API_URL_ENV);
    }
}
