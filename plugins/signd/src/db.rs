use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open a connection pool on the database file, creating the schema if needed.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path.as_ref())
        .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
    let pool = Pool::new(manager)?;
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_id INTEGER NOT NULL,
  process_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  target_dir TEXT,
  finished_pdf_path TEXT
);
CREATE INDEX IF NOT EXISTS processes_file_id ON processes(file_id);
CREATE INDEX IF NOT EXISTS processes_process_id ON processes(process_id);
CREATE INDEX IF NOT EXISTS processes_user_id ON processes(user_id);

CREATE TABLE IF NOT EXISTS file_ids (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  path TEXT NOT NULL UNIQUE,
  fingerprint INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#;
