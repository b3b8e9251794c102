//! App settings (`pritunl.json`) and the on-disk layout under the data dir.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, Result};

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pritunl")
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn conf_path(&self, id: &str) -> PathBuf {
        self.profiles_dir().join(format!("{}.conf", id))
    }

    pub fn ovpn_path(&self, id: &str) -> PathBuf {
        self.profiles_dir().join(format!("{}.ovpn", id))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.profiles_dir().join(format!("{}.log", id))
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("pritunl.json")
    }

    pub fn app_log_path(&self) -> PathBuf {
        self.data_dir.join("pritunl.log")
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    /// Service socket. When set, HTTP and the event socket go over it and
    /// `host` is ignored; `null` selects TCP.
    pub unix_path: Option<PathBuf>,
    pub auth_path: PathBuf,
    pub reconnect_delay_ms: u64,
    pub token_poll_ms: u64,
    pub token_refresh_ms: u64,
    pub request_timeout_secs: u64,
    pub sync_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:9770".into(),
            unix_path: default_unix_path(),
            auth_path: default_auth_path(),
            reconnect_delay_ms: 1000,
            token_poll_ms: 100,
            token_refresh_ms: 3000,
            request_timeout_secs: 20,
            sync_timeout_secs: 3,
        }
    }
}

impl ServiceConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn endpoint(&self) -> Endpoint {
        match &self.unix_path {
            Some(path) if cfg!(unix) => Endpoint::Unix(path.clone()),
            _ => Endpoint::Tcp(self.host.trim_end_matches('/').to_string()),
        }
    }

    /// `ws://` URL of the event socket, derived from `host`.
    pub fn events_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let base = if let Some(rest) = host.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = host.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", host)
        };
        format!("{}/events", base)
    }
}

/// Where the service listens.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

#[cfg(unix)]
fn default_unix_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/run/pritunl.sock"))
}

#[cfg(not(unix))]
fn default_unix_path() -> Option<PathBuf> {
    None
}

#[cfg(windows)]
fn default_auth_path() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\Pritunl\auth")
}

#[cfg(not(windows))]
fn default_auth_path() -> PathBuf {
    PathBuf::from("/var/run/pritunl.auth")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub disable_tray_icon: bool,
    pub classic_interface: bool,
    pub theme: Option<String>,
    pub service: ServiceConfig,
}

impl AppConfig {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), "Failed to read settings: {}", e);
                return Self::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), "Bad settings file, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &json)
            .map_err(|e| AppError::Write(format!("{}: {}", path.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
