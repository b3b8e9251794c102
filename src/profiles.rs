//! Profile lifecycle: the merged view of user profile files, service-owned
//! system profiles and live status.
//!
//! The manager is the only writer of profile state. Readers get an immutable
//! snapshot through [`ProfileManager::subscribe`] or
//! [`ProfileManager::snapshot`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Paths;
use crate::document::{extract_key_blocks, full_data, ConfigDocument};
use crate::error::{AppError, Result};
use crate::models::{Event, EventKind, LiveStatus, Profile, ProfileMeta, SystemProfile};
use crate::service::ServiceApi;
use crate::vault::KeyVault;

pub type Snapshot = Arc<Vec<Profile>>;

#[derive(Debug, Default)]
struct State {
    profiles: Vec<Profile>,
    /// Document text by profile id. Sealed key sections are not included.
    data: HashMap<String, String>,
    /// Output lines received since start, by profile id.
    output: HashMap<String, String>,
}

// ── Ownership transfer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    User,
    System,
}

impl Ownership {
    pub fn of(profile: &Profile) -> Self {
        if profile.system { Self::System } else { Self::User }
    }
}

/// A profile prepared for the destination side of an ownership move. Nothing
/// is changed until [`ProfileManager::commit_transfer`] confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub from: Ownership,
    pub to: Ownership,
    pub profile: Profile,
    /// Full document, key sections included.
    pub data: String,
}

pub fn plan_transfer(profile: &Profile, data: String, to: Ownership) -> Transfer {
    let mut moved = profile.clone();
    moved.system = to == Ownership::System;
    // the service keeps keys inside ovpn_data
    if to == Ownership::System {
        moved.key_data = None;
    }
    Transfer { from: Ownership::of(profile), to, profile: moved, data }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct ProfileManager<S> {
    paths: Paths,
    service: Arc<S>,
    vault: Option<KeyVault>,
    state: Mutex<State>,
    tx: watch::Sender<Snapshot>,
    sync_token: AtomicU64,
}

impl<S: ServiceApi> ProfileManager<S> {
    pub fn new(paths: Paths, service: Arc<S>, vault: Option<KeyVault>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            paths,
            service,
            vault,
            state: Mutex::new(State::default()),
            tx,
            sync_token: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Profile> {
        self.snapshot().iter().find(|p| p.id == id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Profile> {
        self.get(id).ok_or_else(|| AppError::NoProfile(id.to_string()))
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        let mut list = state.profiles.clone();
        list.sort_by(|a, b| {
            a.formatted_name()
                .to_lowercase()
                .cmp(&b.formatted_name().to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        self.tx.send_replace(Arc::new(list));
    }

    fn upsert(&self, profile: Profile, data: Option<String>) {
        let mut state = self.lock();
        if let Some(data) = data {
            state.data.insert(profile.id.clone(), data);
        }
        match state.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(p) => {
                let live = std::mem::take(&mut p.live);
                *p = profile;
                p.live = live;
            }
            None => state.profiles.push(profile),
        }
        self.publish(&state);
    }

    /// Stored document text, sealed key sections excluded.
    pub fn data(&self, id: &str) -> Option<String> {
        self.lock().data.get(id).cloned()
    }

    /// Stored document with sealed key sections restored.
    pub fn full_data(&self, profile: &Profile) -> Result<String> {
        let data = self.data(&profile.id).unwrap_or_default();
        match (&profile.key_data, &self.vault) {
            (Some(sealed), Some(vault)) if !sealed.is_empty() => {
                Ok(full_data(&data, &vault.unseal(sealed)?))
            }
            (Some(sealed), None) if !sealed.is_empty() => Err(AppError::Process(format!(
                "Profile {} has sealed keys but no vault is open",
                profile.id
            ))),
            _ => Ok(data),
        }
    }

    // ── Sync ──────────────────────────────────────────────────────────────────

    /// Reload system profiles, user profile files and live status, then
    /// publish the merged view. Returns false when a newer call started
    /// meanwhile and this result was dropped.
    pub async fn sync_all(&self) -> Result<bool> {
        let token = self.sync_token.fetch_add(1, Ordering::SeqCst) + 1;

        let system = match self.service.system_profiles().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to load system profiles: {}", e);
                Vec::new()
            }
        };
        let user = self.load_user_profiles().await?;
        let status = match self.service.profiles_status().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to load profile status: {}", e);
                HashMap::new()
            }
        };

        if self.sync_token.load(Ordering::SeqCst) != token {
            debug!(token, "Stale profile sync discarded");
            return Ok(false);
        }

        let mut profiles = Vec::with_capacity(system.len() + user.len());
        let mut data = HashMap::new();
        for sp in system {
            let mut p = sp.profile;
            p.system = true;
            p.uv_name = ConfigDocument::parse(&sp.ovpn_data).uv_name();
            data.insert(p.id.clone(), sp.ovpn_data);
            profiles.push(p);
        }
        for (p, ovpn) in user {
            if data.contains_key(&p.id) {
                warn!(profile_id = %p.id, "Profile exists as both user and system profile");
                continue;
            }
            data.insert(p.id.clone(), ovpn);
            profiles.push(p);
        }
        for p in &mut profiles {
            p.live = status.get(&p.id).cloned().unwrap_or_default();
        }

        let mut state = self.lock();
        state.profiles = profiles;
        state.data = data;
        self.publish(&state);
        Ok(true)
    }

    async fn load_user_profiles(&self) -> Result<Vec<(Profile, String)>> {
        let dir = self.paths.profiles_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Read(format!("{}: {}", dir.display(), e))),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let conf_path = self.paths.conf_path(&id);
            let ovpn_path = self.paths.ovpn_path(&id);
            for path in [&conf_path, &ovpn_path, &self.paths.log_path(&id)] {
                normalize_permissions(path).await;
            }

            let conf = match tokio::fs::read_to_string(&conf_path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(profile_id = %id, "Failed to read profile conf: {}", e);
                    continue;
                }
            };
            let mut profile: Profile = match serde_json::from_str(&conf) {
                Ok(p) => p,
                Err(e) => {
                    warn!(profile_id = %id, "Failed to parse profile conf: {}", e);
                    continue;
                }
            };
            profile.id = id;
            profile.system = false;

            let ovpn = tokio::fs::read_to_string(&ovpn_path).await.unwrap_or_default();
            profile.uv_name = ConfigDocument::parse(&ovpn).uv_name();
            out.push((profile, ovpn));
        }
        Ok(out)
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Apply a service event. Returns true when the event names a profile
    /// this manager does not know, meaning a full [`sync_all`] is due.
    ///
    /// [`sync_all`]: Self::sync_all
    pub async fn apply_event(&self, evt: &Event) -> bool {
        let Some(id) = evt.kind.profile_id() else { return false };
        let Some(profile) = self.get(id) else {
            debug!(profile_id = %id, kind = evt.kind.as_str(), "Event for unknown profile");
            return matches!(evt.kind, EventKind::Update(_));
        };

        match &evt.kind {
            EventKind::Update(update) => self.apply_status(&update.id, &update.live),
            EventKind::Output { output, .. } => self.append_output(&profile, output).await,
            EventKind::RegistrationRequired { registration_key, .. } if !profile.system => {
                let mut p = profile;
                p.registration_key = registration_key.clone();
                if let Err(e) = self.save_conf(&p).await {
                    warn!(profile_id = %p.id, "Failed to store registration key: {}", e);
                }
            }
            EventKind::RegistrationPass { .. } if !profile.system && profile.registration_key.is_some() => {
                let mut p = profile;
                p.registration_key = None;
                if let Err(e) = self.save_conf(&p).await {
                    warn!(profile_id = %p.id, "Failed to clear registration key: {}", e);
                }
            }
            _ => {}
        }
        false
    }

    /// Idempotent: an unchanged status publishes nothing.
    fn apply_status(&self, id: &str, live: &LiveStatus) {
        let mut state = self.lock();
        let Some(p) = state.profiles.iter_mut().find(|p| p.id == id) else { return };
        if p.live == *live {
            return;
        }
        debug!(profile_id = %id, status = live.status.as_str(), "Profile status changed");
        p.live = live.clone();
        self.publish(&state);
    }

    async fn append_output(&self, profile: &Profile, output: &str) {
        let mut line = output.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.lock().output.entry(profile.id.clone()).or_default().push_str(&line);

        if profile.system {
            return;
        }
        let path = self.paths.log_path(&profile.id);
        if let Err(e) = append_private(&path, &line).await {
            warn!(profile_id = %profile.id, "Failed to append profile log: {}", e);
        }
    }

    /// Output received over the event socket during this session.
    pub fn session_output(&self, id: &str) -> String {
        self.lock().output.get(id).cloned().unwrap_or_default()
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    pub async fn save_conf(&self, profile: &Profile) -> Result<()> {
        if profile.system {
            let sprfl = SystemProfile {
                profile: profile.clone(),
                ovpn_data: self.full_data(profile)?,
            };
            self.service.put_system_profile(&sprfl).await?;
        } else {
            let json = serde_json::to_string_pretty(profile)?;
            write_private(&self.paths.conf_path(&profile.id), &json).await?;
        }
        self.upsert(profile.clone(), None);
        Ok(())
    }

    /// Store a new document for a profile. For user profiles the key sections
    /// are sealed into `key_data` when a vault is open.
    pub async fn save_data(&self, profile: &Profile, data: &str) -> Result<Profile> {
        let mut profile = profile.clone();
        profile.uv_name = ConfigDocument::parse(data).uv_name();

        if profile.system {
            let sprfl = SystemProfile { profile: profile.clone(), ovpn_data: data.to_string() };
            self.service.put_system_profile(&sprfl).await?;
            self.upsert(profile.clone(), Some(data.to_string()));
            return Ok(profile);
        }

        let mut stored = data.to_string();
        if let Some(vault) = &self.vault {
            let (stripped, material) = extract_key_blocks(data);
            if !material.is_empty() {
                profile.key_data = Some(vault.seal(&material)?);
                stored = stripped;
                let json = serde_json::to_string_pretty(&profile)?;
                write_private(&self.paths.conf_path(&profile.id), &json).await?;
            }
        }
        write_private(&self.paths.ovpn_path(&profile.id), &stored).await?;
        self.upsert(profile.clone(), Some(stored));
        Ok(profile)
    }

    /// Apply a merged sync result: metadata onto the profile, then the
    /// document itself.
    pub async fn apply_sync(&self, profile: &Profile, doc: &ConfigDocument) -> Result<Profile> {
        let mut updated = profile.clone();
        if let Some(meta) = &doc.metadata {
            updated = updated.with_meta(meta);
            if !updated.system {
                self.save_conf(&updated).await?;
            }
        }
        self.save_data(&updated, &doc.serialize()).await
    }

    // ── Import ────────────────────────────────────────────────────────────────

    /// Store an imported document. A profile with the same organization,
    /// server and user is updated in place; otherwise a new id is assigned.
    pub async fn import_document(&self, meta: &ProfileMeta, data: &str) -> Result<Profile> {
        let incoming = Profile::from_meta(meta);
        let existing = incoming.identity().and_then(|triple| {
            self.snapshot().iter().find(|p| p.identity() == Some(triple)).cloned()
        });

        let mut profile = match existing {
            Some(cur) => {
                info!(profile_id = %cur.id, "Import updates existing profile");
                cur.with_meta(meta)
            }
            None => {
                let mut p = incoming;
                p.id = uuid::Uuid::new_v4().simple().to_string();
                info!(profile_id = %p.id, "Import creates profile");
                p
            }
        };

        if profile.system {
            profile = self.save_data(&profile, data).await?;
        } else {
            // a re-import replaces any previously sealed keys
            profile.key_data = None;
            self.save_conf(&profile).await?;
            profile = self.save_data(&profile, data).await?;
        }

        if profile.force_connect && !profile.system {
            profile = self.transfer(&profile.id, Ownership::System).await?;
        }
        Ok(profile)
    }

    // ── Ownership ─────────────────────────────────────────────────────────────

    pub async fn set_autostart(&self, id: &str, on: bool) -> Result<Profile> {
        let to = if on { Ownership::System } else { Ownership::User };
        self.transfer(id, to).await
    }

    /// Move a profile between user files and the service. The destination is
    /// written first; the source is only removed once that succeeded.
    pub async fn transfer(&self, id: &str, to: Ownership) -> Result<Profile> {
        let profile = self.require(id)?;
        if Ownership::of(&profile) == to {
            return Ok(profile);
        }
        let plan = plan_transfer(&profile, self.full_data(&profile)?, to);
        self.commit_transfer(plan).await
    }

    pub async fn commit_transfer(&self, plan: Transfer) -> Result<Profile> {
        let id = plan.profile.id.clone();

        // destination
        let mut moved = plan.profile.clone();
        match plan.to {
            Ownership::System => {
                let sprfl = SystemProfile { profile: moved.clone(), ovpn_data: plan.data.clone() };
                self.service.put_system_profile(&sprfl).await?;
            }
            Ownership::User => {
                moved = self.write_user_files(&moved, &plan.data).await?;
            }
        }

        // source; from here on the destination owns the profile
        let removed = match plan.from {
            Ownership::System => self.service.delete_system_profile(&id).await,
            Ownership::User => self.remove_user_files(&id).await,
        };
        if let Err(e) = removed {
            warn!(profile_id = %id, "Profile moved but source copy remains: {}", e);
        }

        info!(
            profile_id = %id,
            system = moved.system,
            "Profile ownership moved"
        );
        let stored = if moved.system { plan.data } else { self.data_on_disk(&id).await };
        self.upsert(moved.clone(), Some(stored));
        Ok(moved)
    }

    async fn write_user_files(&self, profile: &Profile, data: &str) -> Result<Profile> {
        let mut profile = profile.clone();
        let mut stored = data.to_string();
        if let Some(vault) = &self.vault {
            let (stripped, material) = extract_key_blocks(data);
            if !material.is_empty() {
                profile.key_data = Some(vault.seal(&material)?);
                stored = stripped;
            }
        }
        let json = serde_json::to_string_pretty(&profile)?;
        write_private(&self.paths.conf_path(&profile.id), &json).await?;
        if let Err(e) = write_private(&self.paths.ovpn_path(&profile.id), &stored).await {
            let _ = tokio::fs::remove_file(self.paths.conf_path(&profile.id)).await;
            return Err(e);
        }
        Ok(profile)
    }

    async fn data_on_disk(&self, id: &str) -> String {
        tokio::fs::read_to_string(self.paths.ovpn_path(id)).await.unwrap_or_default()
    }

    /// The `.conf` goes last so a partial failure leaves a loadable profile.
    async fn remove_user_files(&self, id: &str) -> Result<()> {
        for path in [self.paths.log_path(id), self.paths.ovpn_path(id), self.paths.conf_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AppError::Write(format!("{}: {}", path.display(), e))),
            }
        }
        Ok(())
    }

    // ── Delete / logs ─────────────────────────────────────────────────────────

    pub async fn delete(&self, id: &str) -> Result<()> {
        let profile = self.require(id)?;
        if profile.is_connected() {
            if let Err(e) = self.service.disconnect(id).await {
                warn!(profile_id = %id, "Disconnect before delete failed: {}", e);
            }
        }
        if profile.system {
            self.service.delete_system_profile(id).await?;
        } else {
            self.remove_user_files(id).await?;
        }

        let mut state = self.lock();
        state.profiles.retain(|p| p.id != id);
        state.data.remove(id);
        state.output.remove(id);
        self.publish(&state);
        info!(profile_id = %id, "Profile deleted");
        Ok(())
    }

    pub async fn profile_log(&self, id: &str) -> Result<String> {
        let profile = self.require(id)?;
        if profile.system {
            return self.service.system_profile_log(id).await;
        }
        match tokio::fs::read_to_string(self.paths.log_path(id)).await {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AppError::Read(e.to_string())),
        }
    }

    pub async fn clear_profile_log(&self, id: &str) -> Result<()> {
        let profile = self.require(id)?;
        self.lock().output.remove(id);
        if profile.system {
            return self.service.clear_system_profile_log(id).await;
        }
        match tokio::fs::remove_file(self.paths.log_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Write(e.to_string())),
        }
    }
}

// ── File helpers ──────────────────────────────────────────────────────────────

async fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| AppError::Write(format!("{}: {}", path.display(), e)))?;
    set_private(path).await
}

async fn append_private(path: &Path, contents: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| AppError::Write(format!("{}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes()).await?;
    set_private(path).await
}

#[cfg(unix)]
async fn set_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_private(_path: &Path) -> Result<()> {
    Ok(())
}

/// Force mode 0600 on an existing profile file. Failures are logged only.
#[cfg(unix)]
async fn normalize_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = tokio::fs::metadata(path).await else { return };
    if meta.permissions().mode() & 0o777 == 0o600 {
        return;
    }
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        error!(path = %path.display(), "Failed to set profile file permissions: {}", e);
    }
}

#[cfg(not(unix))]
async fn normalize_permissions(_path: &Path) {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ConnectRequest, ProfileStatus, ProfileUpdate, ServiceState, TokenRequest};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// In-memory service. The first `system_profiles` call can be held
    /// until `gate` is notified.
    #[derive(Default)]
    pub(crate) struct FakeService {
        pub system: Mutex<HashMap<String, SystemProfile>>,
        pub status: Mutex<HashMap<String, LiveStatus>>,
        pub connects: Mutex<Vec<ConnectRequest>>,
        pub token_valid: Mutex<Option<bool>>,
        pub token_deletes: Mutex<Vec<String>>,
        pub fail_put: Mutex<bool>,
        pub hold_first: Mutex<bool>,
        pub gate: Notify,
        pub listed: AtomicUsize,
    }

    #[async_trait]
    impl ServiceApi for FakeService {
        async fn profiles_status(&self) -> Result<HashMap<String, LiveStatus>> {
            Ok(self.status.lock().unwrap().clone())
        }
        async fn connect(&self, req: &ConnectRequest) -> Result<()> {
            self.connects.lock().unwrap().push(req.clone());
            Ok(())
        }
        async fn disconnect(&self, _profile_id: &str) -> Result<()> {
            Ok(())
        }
        async fn system_profiles(&self) -> Result<Vec<SystemProfile>> {
            let n = self.listed.fetch_add(1, Ordering::SeqCst);
            let snapshot: Vec<SystemProfile> = self.system.lock().unwrap().values().cloned().collect();
            let hold = n == 0 && *self.hold_first.lock().unwrap();
            if hold {
                self.gate.notified().await;
            }
            Ok(snapshot)
        }
        async fn put_system_profile(&self, sprfl: &SystemProfile) -> Result<()> {
            if *self.fail_put.lock().unwrap() {
                return Err(AppError::from_response("Service: System profile save failed", 500, "{}"));
            }
            self.system.lock().unwrap().insert(sprfl.profile.id.clone(), sprfl.clone());
            Ok(())
        }
        async fn delete_system_profile(&self, profile_id: &str) -> Result<()> {
            self.system.lock().unwrap().remove(profile_id);
            Ok(())
        }
        async fn system_profile_log(&self, _profile_id: &str) -> Result<String> {
            Ok("service-side log".into())
        }
        async fn clear_system_profile_log(&self, _profile_id: &str) -> Result<()> {
            Ok(())
        }
        async fn service_log(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn clear_service_log(&self) -> Result<()> {
            Ok(())
        }
        async fn token_update(&self, _req: &TokenRequest<'_>) -> Result<bool> {
            match *self.token_valid.lock().unwrap() {
                Some(v) => Ok(v),
                None => Err(AppError::request("Service: Token update failed")),
            }
        }
        async fn token_delete(&self, profile_id: &str) -> Result<()> {
            self.token_deletes.lock().unwrap().push(profile_id.to_string());
            Ok(())
        }
        async fn ping(&self) -> Result<bool> {
            Ok(true)
        }
        async fn wakeup(&self) -> Result<bool> {
            Ok(true)
        }
        async fn state(&self) -> Result<ServiceState> {
            Ok(ServiceState::default())
        }
        async fn restart(&self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn manager(dir: &Path) -> ProfileManager<FakeService> {
        let vault = KeyVault::open(dir).unwrap();
        ProfileManager::new(Paths::new(dir), Arc::new(FakeService::default()), Some(vault))
    }

    fn sys(id: &str, name: &str) -> SystemProfile {
        SystemProfile {
            profile: Profile { id: id.into(), name: Some(name.into()), ..Default::default() },
            ovpn_data: "client\n".into(),
        }
    }

    fn meta(json: &str) -> ProfileMeta {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn missing_profiles_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        assert!(mgr.sync_all().await.unwrap());
        assert!(mgr.snapshot().is_empty());
    }

    #[tokio::test]
    async fn overlapping_sync_keeps_newest_result() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        *mgr.service.hold_first.lock().unwrap() = true;
        mgr.service.system.lock().unwrap().insert("stale".into(), sys("stale", "Stale"));

        let first = mgr.sync_all();
        let second = async {
            {
                let mut system = mgr.service.system.lock().unwrap();
                system.clear();
                system.insert("fresh".into(), sys("fresh", "Fresh"));
            }
            let applied = mgr.sync_all().await;
            mgr.service.gate.notify_one();
            applied
        };
        let (a, b) = tokio::join!(first, second);

        assert!(!a.unwrap());
        assert!(b.unwrap());
        let ids: Vec<String> = mgr.snapshot().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[tokio::test]
    async fn repeated_update_event_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.service.system.lock().unwrap().insert("p1".into(), sys("p1", "Office"));
        mgr.sync_all().await.unwrap();

        let evt = Event {
            id: "e1".into(),
            kind: EventKind::Update(ProfileUpdate {
                id: "p1".into(),
                live: LiveStatus { status: ProfileStatus::Connected, timestamp: 10, ..Default::default() },
            }),
        };
        let mut rx = mgr.subscribe();
        rx.borrow_and_update();

        assert!(!mgr.apply_event(&evt).await);
        let once = mgr.snapshot();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        mgr.apply_event(&evt).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(*mgr.snapshot(), *once);
        assert_eq!(once[0].live.status, ProfileStatus::Connected);
    }

    #[tokio::test]
    async fn import_with_same_identity_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let m = meta(r#"{"organization_id":"o1","server_id":"s1","user_id":"u1","name":"first"}"#);
        let created = mgr.import_document(&m, "client\nremote a 1\n").await.unwrap();

        let m2 = meta(r#"{"organization_id":"o1","server_id":"s1","user_id":"u1","server":"east"}"#);
        let updated = mgr.import_document(&m2, "client\nremote b 2\n").await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.name.as_deref(), Some("first"));
        assert_eq!(updated.server.as_deref(), Some("east"));
        let files: Vec<_> = std::fs::read_dir(mgr.paths.profiles_dir()).unwrap().collect();
        assert_eq!(files.len(), 2);

        mgr.sync_all().await.unwrap();
        assert_eq!(mgr.snapshot().len(), 1);
        assert_eq!(mgr.data(&created.id).unwrap(), "client\nremote b 2\n");
    }

    #[tokio::test]
    async fn key_sections_are_sealed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let data = "client\n<ca>\nCA\n</ca>\n<key>\nSECRET\n</key>\n";
        let p = mgr.import_document(&ProfileMeta::default(), data).await.unwrap();

        let on_disk = std::fs::read_to_string(mgr.paths.ovpn_path(&p.id)).unwrap();
        assert!(!on_disk.contains("SECRET"));
        assert!(p.key_data.is_some());

        mgr.sync_all().await.unwrap();
        let p = mgr.require(&p.id).unwrap();
        let full = mgr.full_data(&p).unwrap();
        assert!(full.contains("<key>\nSECRET\n</key>"));
        assert!(full.contains("<ca>\nCA\n</ca>"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loose_permissions_are_tightened() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let profiles = mgr.paths.profiles_dir();
        std::fs::create_dir_all(&profiles).unwrap();
        std::fs::write(profiles.join("p1.conf"), r#"{"name":"office"}"#).unwrap();
        std::fs::write(profiles.join("p1.ovpn"), "client\nsetenv UV_NAME desk\n").unwrap();
        std::fs::set_permissions(profiles.join("p1.conf"), std::fs::Permissions::from_mode(0o644)).unwrap();

        mgr.sync_all().await.unwrap();
        let mode = std::fs::metadata(profiles.join("p1.conf")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let p = mgr.require("p1").unwrap();
        assert_eq!(p.uv_name.as_deref(), Some("desk"));
    }

    #[tokio::test]
    async fn autostart_moves_profile_after_destination_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr
            .import_document(&meta(r#"{"name":"office"}"#), "client\n<key>\nK\n</key>\n")
            .await
            .unwrap();

        let moved = mgr.set_autostart(&p.id, true).await.unwrap();
        assert!(moved.system);
        assert!(!mgr.paths.conf_path(&p.id).exists());
        let stored = mgr.service.system.lock().unwrap()[&p.id].clone();
        assert!(stored.ovpn_data.contains("<key>\nK\n</key>"));
        assert!(stored.profile.key_data.is_none());

        let back = mgr.set_autostart(&p.id, false).await.unwrap();
        assert!(!back.system);
        assert!(mgr.paths.conf_path(&p.id).exists());
        assert!(mgr.service.system.lock().unwrap().is_empty());
        let full = mgr.full_data(&back).unwrap();
        assert!(full.contains("<key>\nK\n</key>"));
    }

    #[tokio::test]
    async fn failed_destination_leaves_source_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr.import_document(&meta(r#"{"name":"office"}"#), "client\n").await.unwrap();
        *mgr.service.fail_put.lock().unwrap() = true;

        assert!(mgr.set_autostart(&p.id, true).await.is_err());
        assert!(mgr.paths.conf_path(&p.id).exists());
        assert!(mgr.paths.ovpn_path(&p.id).exists());
        assert!(!mgr.require(&p.id).unwrap().system);
    }

    #[tokio::test]
    async fn stuck_source_files_do_not_lose_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr.import_document(&meta(r#"{"name":"office"}"#), "client\n").await.unwrap();
        std::fs::create_dir_all(mgr.paths.log_path(&p.id).join("busy")).unwrap();

        let moved = mgr.set_autostart(&p.id, true).await.unwrap();
        assert!(moved.system);
        assert!(mgr.service.system.lock().unwrap().contains_key(&p.id));
        assert!(mgr.paths.conf_path(&p.id).exists());
        assert!(mgr.paths.ovpn_path(&p.id).exists());
        assert!(mgr.require(&p.id).unwrap().system);

        mgr.sync_all().await.unwrap();
        assert!(mgr.require(&p.id).unwrap().system);
        assert_eq!(mgr.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn force_connect_import_lands_in_system() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr
            .import_document(&meta(r#"{"name":"kiosk","force_connect":true}"#), "client\n")
            .await
            .unwrap();
        assert!(p.system);
        assert!(mgr.service.system.lock().unwrap().contains_key(&p.id));
        assert!(!mgr.paths.conf_path(&p.id).exists());
    }

    #[tokio::test]
    async fn output_events_append_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr.import_document(&meta(r#"{"name":"office"}"#), "client\n").await.unwrap();
        for line in ["one", "two"] {
            let evt = Event {
                id: "e".into(),
                kind: EventKind::Output { profile_id: p.id.clone(), output: line.into() },
            };
            mgr.apply_event(&evt).await;
        }
        assert_eq!(mgr.profile_log(&p.id).await.unwrap(), "one\ntwo\n");
        assert_eq!(mgr.session_output(&p.id), "one\ntwo\n");
        mgr.clear_profile_log(&p.id).await.unwrap();
        assert_eq!(mgr.profile_log(&p.id).await.unwrap(), "");
    }

    #[tokio::test]
    async fn delete_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let p = mgr.import_document(&meta(r#"{"name":"office"}"#), "client\n").await.unwrap();
        mgr.delete(&p.id).await.unwrap();
        assert!(!mgr.paths.conf_path(&p.id).exists());
        assert!(mgr.get(&p.id).is_none());
        assert!(matches!(mgr.delete(&p.id).await, Err(AppError::NoProfile(_))));
    }

    #[test]
    fn snapshot_sorted_by_name_then_id() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        for (id, name) in [("b", "Same"), ("a", "Same"), ("c", "Alpha")] {
            mgr.upsert(Profile { id: id.into(), name: Some(name.into()), ..Default::default() }, None);
        }
        let ids: Vec<String> = mgr.snapshot().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
