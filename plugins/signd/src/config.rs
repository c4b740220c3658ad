use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the plugin.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Run with stdio protocol used by the host.
    #[arg(long)]
    pub stdio: bool,
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the plugin database.
    pub data_dir: PathBuf,
    /// Root of the host file tree (`<root>/<user>/files`).
    pub storage_root: PathBuf,
    /// Host instance id, used to scope remote process listings.
    pub instance_id: String,
    /// How often the orphan cleanup runs.
    pub cleanup_interval: Duration,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    instance: FileInstance,
    #[serde(default)]
    cleanup: FileCleanup,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    root: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct FileInstance {
    id: Option<String>,
}

#[derive(Deserialize)]
struct FileCleanup {
    #[serde(default = "default_cleanup_secs")]
    interval_secs: u64,
}

fn default_port() -> u16 {
    8788
}

fn default_logging() -> bool {
    true
}

fn default_cleanup_secs() -> u64 {
    86_400
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileCleanup {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_secs(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("SIGND_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/signd.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut cleanup_secs = file_cfg.cleanup.interval_secs;

        // environment overrides
        if let Ok(p) = std::env::var("SIGND_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("SIGND_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("SIGND_CLEANUP_INTERVAL_SECS") {
            if let Ok(s) = s.parse::<u64>() {
                cleanup_secs = s;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if cleanup_secs == 0 {
            anyhow::bail!("invalid_cleanup_interval");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let storage_root = std::env::var("HOST_STORAGE_ROOT")
            .map(PathBuf::from)
            .ok()
            .or(file_cfg.storage.root)
            .unwrap_or_else(|| data_dir.join("storage"));
        let instance_id = std::env::var("HOST_INSTANCE_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .or(file_cfg.instance.id)
            .unwrap_or_else(|| "homecore".into());

        Ok(Self {
            bind,
            data_dir,
            storage_root,
            instance_id,
            cleanup_interval: Duration::from_secs(cleanup_secs),
            logging_enabled: logging,
        })
    }

    /// Location of the plugin's SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("signd.db")
    }
}

/// Determine the default data directory for the plugin.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLUGIN_DATA_DIR") {
        PathBuf::from(dir)
    } else if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/homecore/plugins/signd");
        p
    } else {
        PathBuf::from("./signd_data")
    }
}
