//! Domain records (profiles, live status, service events) and the raw JSON
//! bodies exchanged with the background service and sync hosts.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

// ── Live status ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileStatus {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ProfileStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "connecting"     => Self::Connecting,
            "authenticating" => Self::Authenticating,
            "connected"      => Self::Connected,
            "reconnecting"   => Self::Reconnecting,
            "disconnecting"  => Self::Disconnecting,
            _                => Self::Disconnected,
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disconnected   => "disconnected",
            Self::Connecting     => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected      => "connected",
            Self::Reconnecting   => "reconnecting",
            Self::Disconnecting  => "disconnecting",
        }
    }
}

/// Connection state reported by the service. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStatus {
    pub status: ProfileStatus,
    /// Connect time, epoch seconds.
    pub timestamp: i64,
    pub server_addr: Option<String>,
    pub client_addr: Option<String>,
}

impl LiveStatus {
    pub fn from_raw(raw: RawLiveStatus) -> Self {
        Self {
            status: ProfileStatus::from_str(&raw.status),
            timestamp: raw.timestamp,
            server_addr: raw.server_addr.filter(|s| !s.is_empty()),
            client_addr: raw.client_addr.filter(|s| !s.is_empty()),
        }
    }
}

// ── Profile ───────────────────────────────────────────────────────────────────

/// A stored VPN connection configuration.
///
/// The serialized form is the `{id}.conf` file body. `system`, `uv_name` and
/// `live` are derived at load time and never written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip)]
    pub system: bool,
    pub name: Option<String>,
    pub wg: bool,
    pub last_mode: Option<String>,
    pub organization_id: Option<String>,
    pub organization: Option<String>,
    pub server_id: Option<String>,
    pub server: Option<String>,
    pub user_id: Option<String>,
    pub user: Option<String>,
    pub pre_connect_msg: Option<String>,
    pub dynamic_firewall: bool,
    pub disable_gateway: bool,
    pub sso_auth: bool,
    pub force_connect: bool,
    pub password_mode: Option<String>,
    pub token: bool,
    pub token_ttl: Option<u64>,
    pub disable_reconnect: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub sync_hosts: Vec<String>,
    pub sync_hash: Option<String>,
    pub sync_secret: Option<String>,
    pub sync_token: Option<String>,
    pub server_public_key: Option<Vec<String>>,
    pub server_box_public_key: Option<String>,
    /// Sealed key material stripped from the `.ovpn` document.
    pub key_data: Option<String>,
    pub registration_key: Option<String>,
    #[serde(skip)]
    pub uv_name: Option<String>,
    #[serde(skip)]
    pub live: LiveStatus,
}

/// The service encodes empty lists as `null`.
fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Metadata overlay carried in a document's `#{ … #}` block. Every field is
/// optional: only the fields present overwrite a profile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProfileMeta {
    pub name: Option<String>,
    pub wg: Option<bool>,
    pub last_mode: Option<String>,
    pub organization_id: Option<String>,
    pub organization: Option<String>,
    pub server_id: Option<String>,
    pub server: Option<String>,
    pub user_id: Option<String>,
    pub user: Option<String>,
    pub pre_connect_msg: Option<String>,
    pub dynamic_firewall: Option<bool>,
    pub disable_gateway: Option<bool>,
    pub sso_auth: Option<bool>,
    pub force_connect: Option<bool>,
    pub password_mode: Option<String>,
    pub token: Option<bool>,
    pub token_ttl: Option<u64>,
    pub disable_reconnect: Option<bool>,
    pub sync_hosts: Option<Vec<String>>,
    pub sync_hash: Option<String>,
    pub sync_secret: Option<String>,
    pub sync_token: Option<String>,
    pub server_public_key: Option<Vec<String>>,
    pub server_box_public_key: Option<String>,
}

macro_rules! overlay {
    ($dst:ident, $src:ident; $($field:ident),* $(,)?) => {
        $( if let Some(v) = &$src.$field { $dst.$field = v.clone().into(); } )*
    };
}

impl Profile {
    pub fn from_meta(meta: &ProfileMeta) -> Self {
        Self::default().with_meta(meta)
    }

    /// Copy of this profile with every field present in `meta` applied.
    pub fn with_meta(&self, meta: &ProfileMeta) -> Self {
        let mut p = self.clone();
        overlay!(p, meta;
            name, last_mode, organization_id, organization, server_id, server,
            user_id, user, pre_connect_msg, password_mode, token_ttl, sync_hash,
            sync_secret, sync_token, server_public_key, server_box_public_key,
        );
        if let Some(v) = meta.wg { p.wg = v; }
        if let Some(v) = meta.dynamic_firewall { p.dynamic_firewall = v; }
        if let Some(v) = meta.disable_gateway { p.disable_gateway = v; }
        if let Some(v) = meta.sso_auth { p.sso_auth = v; }
        if let Some(v) = meta.force_connect { p.force_connect = v; }
        if let Some(v) = meta.token { p.token = v; }
        if let Some(v) = meta.disable_reconnect { p.disable_reconnect = v; }
        if let Some(v) = &meta.sync_hosts { p.sync_hosts = v.clone(); }
        p
    }

    /// The (organization, server, user) triple used to detect re-imports.
    pub fn identity(&self) -> Option<(&str, &str, &str)> {
        match (&self.organization_id, &self.server_id, &self.user_id) {
            (Some(o), Some(s), Some(u)) if !o.is_empty() && !s.is_empty() && !u.is_empty() => {
                Some((o.as_str(), s.as_str(), u.as_str()))
            }
            _ => None,
        }
    }

    pub fn formatted_name(&self) -> String {
        let mut name = match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => match (self.user.as_deref(), self.server.as_deref()) {
                (Some(user), server) if !user.is_empty() => {
                    let mut n = user.split('@').next().unwrap_or(user).to_string();
                    if let Some(org) = self.organization.as_deref().filter(|o| !o.is_empty()) {
                        n.push('@');
                        n.push_str(org);
                    }
                    if let Some(server) = server.filter(|s| !s.is_empty()) {
                        n.push_str(&format!(" ({})", server));
                    }
                    n
                }
                (_, Some(server)) if !server.is_empty() => server.to_string(),
                _ => self
                    .uv_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "Unknown Profile".into()),
            },
        };
        if self.system {
            name.push_str(" (system)");
        }
        name
    }

    pub fn is_connected(&self) -> bool {
        self.live.status != ProfileStatus::Disconnected
    }

    pub fn status_label(&self, now: i64) -> String {
        match self.live.status {
            ProfileStatus::Connected => {
                format_uptime(now - self.live.timestamp).unwrap_or_else(|| "Connected".into())
            }
            ProfileStatus::Connecting     => "Connecting".into(),
            ProfileStatus::Authenticating => "Authenticating".into(),
            ProfileStatus::Reconnecting   => "Reconnecting".into(),
            ProfileStatus::Disconnecting  => "Disconnecting".into(),
            ProfileStatus::Disconnected   => "Disconnected".into(),
        }
    }

    pub fn server_public_key_joined(&self) -> Option<String> {
        self.server_public_key.as_ref().map(|k| k.join("\n"))
    }
}

/// `1 day 2 hours 5 mins 1 sec`. Zero units are left out.
pub fn format_uptime(secs: i64) -> Option<String> {
    if secs <= 0 {
        return None;
    }
    let mut rest = secs;
    let mut parts = Vec::new();
    for (unit, label) in [(86400, "day"), (3600, "hour"), (60, "min"), (1, "sec")] {
        let n = rest / unit;
        rest -= n * unit;
        if n > 0 {
            parts.push(format!("{} {}{}", n, label, if n > 1 { "s" } else { "" }));
        }
    }
    Some(parts.join(" "))
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// ── Service events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Update(ProfileUpdate),
    Output { profile_id: String, output: String },
    AuthError { profile_id: String },
    Inactive { profile_id: String },
    TimeoutError { profile_id: String },
    OfflineError { profile_id: String },
    ConnectionError { profile_id: String },
    ConfigurationError { profile_id: String },
    HandshakeTimeout { profile_id: String },
    SsoAuth { profile_id: String, url: String },
    RegistrationRequired { profile_id: String, registration_key: Option<String> },
    RegistrationPass { profile_id: String },
    Wakeup,
}

impl EventKind {
    pub const TYPES: &'static [&'static str] = &[
        "update", "output", "auth_error", "inactive", "timeout_error",
        "offline_error", "connection_error", "configuration_error",
        "handshake_timeout", "sso_auth", "registration_required",
        "registration_pass", "wakeup",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Update(_)                  => "update",
            Self::Output { .. }              => "output",
            Self::AuthError { .. }           => "auth_error",
            Self::Inactive { .. }            => "inactive",
            Self::TimeoutError { .. }        => "timeout_error",
            Self::OfflineError { .. }        => "offline_error",
            Self::ConnectionError { .. }     => "connection_error",
            Self::ConfigurationError { .. }  => "configuration_error",
            Self::HandshakeTimeout { .. }    => "handshake_timeout",
            Self::SsoAuth { .. }             => "sso_auth",
            Self::RegistrationRequired { .. } => "registration_required",
            Self::RegistrationPass { .. }    => "registration_pass",
            Self::Wakeup                     => "wakeup",
        }
    }

    pub fn profile_id(&self) -> Option<&str> {
        match self {
            Self::Update(u) => Some(&u.id),
            Self::Output { profile_id, .. }
            | Self::AuthError { profile_id }
            | Self::Inactive { profile_id }
            | Self::TimeoutError { profile_id }
            | Self::OfflineError { profile_id }
            | Self::ConnectionError { profile_id }
            | Self::ConfigurationError { profile_id }
            | Self::HandshakeTimeout { profile_id }
            | Self::SsoAuth { profile_id, .. }
            | Self::RegistrationRequired { profile_id, .. }
            | Self::RegistrationPass { profile_id } => Some(profile_id),
            Self::Wakeup => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub id: String,
    pub live: LiveStatus,
}

/// An asynchronous message from the background service.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
}

impl Event {
    pub fn from_raw(raw: RawEvent) -> Result<Self> {
        let data = raw.data.unwrap_or(Value::Null);
        let field = |key: &str| -> String {
            data.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
        };
        let profile_id = field("id");
        let kind = match raw.kind.as_str() {
            "update" => {
                let status: RawLiveStatus = serde_json::from_value(data.clone())?;
                EventKind::Update(ProfileUpdate { id: profile_id, live: LiveStatus::from_raw(status) })
            }
            "output" => EventKind::Output { output: field("output"), profile_id },
            "auth_error" => EventKind::AuthError { profile_id },
            "inactive" => EventKind::Inactive { profile_id },
            "timeout_error" => EventKind::TimeoutError { profile_id },
            "offline_error" => EventKind::OfflineError { profile_id },
            "connection_error" => EventKind::ConnectionError { profile_id },
            "configuration_error" => EventKind::ConfigurationError { profile_id },
            "handshake_timeout" => EventKind::HandshakeTimeout { profile_id },
            "sso_auth" => EventKind::SsoAuth { url: field("url"), profile_id },
            "registration_required" => {
                let key = field("registration_key");
                EventKind::RegistrationRequired {
                    registration_key: if key.is_empty() { None } else { Some(key) },
                    profile_id,
                }
            }
            "registration_pass" => EventKind::RegistrationPass { profile_id },
            "wakeup" => EventKind::Wakeup,
            other => return Err(AppError::Parse(format!("Unknown event type: {}", other))),
        };
        Ok(Self { id: raw.id, kind })
    }
}

// ── Raw JSON bodies (service + sync host) ─────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLiveStatus {
    pub status: String,
    pub timestamp: i64,
    pub server_addr: Option<String>,
    pub client_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// System profile body for `GET/PUT /sprofile`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemProfile {
    #[serde(flatten)]
    pub profile: Profile,
    #[serde(default)]
    pub ovpn_data: String,
}

/// Body of `POST /profile`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectRequest {
    pub id: String,
    pub mode: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub server_id: Option<String>,
    pub sync_hosts: Vec<String>,
    pub sync_token: Option<String>,
    pub sync_secret: Option<String>,
    pub username: String,
    pub password: String,
    pub dynamic_firewall: bool,
    pub disable_gateway: bool,
    pub sso_auth: bool,
    pub server_public_key: Option<String>,
    pub server_box_public_key: Option<String>,
    pub token_ttl: Option<u64>,
    pub reconnect: bool,
    pub timeout: bool,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileIdBody<'a> {
    pub id: &'a str,
}

/// Body of `PUT /token` and `DELETE /token`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest<'a> {
    pub profile: &'a str,
    pub server_public_key: Option<String>,
    pub server_box_public_key: Option<&'a str>,
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceState {
    pub wg: bool,
    pub version: String,
    pub upgrade: bool,
    pub security: bool,
}

/// Sync host response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncEnvelope {
    pub conf: String,
    pub signature: String,
}
