//! Profile import from `.ovpn`/`.conf` files, tar archives and profile URIs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{error, info, warn};
use url::Url;

use crate::document::{ConfigDocument, KeyFiles};
use crate::error::{AppError, Result};
use crate::models::{Profile, ProfileMeta};
use crate::profiles::ProfileManager;
use crate::service::ServiceApi;

pub const MAX_IMPORT_SIZE: u64 = 3_000_000;
const URI_TIMEOUT: Duration = Duration::from_secs(12);

fn extension(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|e| e.to_str())
}

fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// A `.conf` holding a bare JSON object is profile metadata, not a tunnel
/// config.
fn json_meta(data: &str) -> Option<ProfileMeta> {
    if !data.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str(data).ok()
}

// ── Import set ────────────────────────────────────────────────────────────────

/// Files gathered for one import. Every entry is also available to the
/// documents as a key file referenced by its path.
#[derive(Debug, Default)]
pub struct ImportSet {
    files: BTreeMap<String, String>,
    origin_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    path: String,
    raw: String,
    companion: Option<ProfileMeta>,
}

impl ImportSet {
    pub fn new(origin_dir: impl Into<PathBuf>) -> Self {
        Self { files: BTreeMap::new(), origin_dir: origin_dir.into() }
    }

    pub fn add_data(&mut self, path: impl Into<String>, data: impl Into<String>) {
        self.files.insert(path.into(), data.into());
    }

    pub async fn add_path(&mut self, path: &Path) -> Result<()> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Read(format!("{}: {}", path.display(), e)))?;
        self.add_data(path.to_string_lossy(), data);
        Ok(())
    }

    pub async fn add_tar(&mut self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        let members = tokio::task::spawn_blocking(move || read_tar(&path))
            .await
            .map_err(|e| AppError::Process(format!("Tar reader: {}", e)))??;
        for (name, data) in members {
            self.add_data(name, data);
        }
        Ok(())
    }

    fn pending(&self) -> Vec<Pending> {
        let mut out = Vec::new();
        for (path, data) in &self.files {
            match extension(path) {
                Some("ovpn") => {
                    let sibling = Path::new(path).with_extension("conf");
                    let companion = self
                        .files
                        .get(sibling.to_string_lossy().as_ref())
                        .and_then(|d| json_meta(d));
                    out.push(Pending { path: path.clone(), raw: data.clone(), companion });
                }
                Some("conf") => {
                    let sibling = Path::new(path).with_extension("ovpn");
                    let paired = self.files.contains_key(sibling.to_string_lossy().as_ref());
                    if paired && json_meta(data).is_some() {
                        continue;
                    }
                    out.push(Pending { path: path.clone(), raw: data.clone(), companion: None });
                }
                _ => {}
            }
        }
        out
    }

    /// Import every document in the set. Each document is independent: a
    /// failure is logged and the rest still import.
    pub async fn import<S: ServiceApi>(self, mgr: &ProfileManager<S>) -> Result<Vec<Profile>> {
        let pending = self.pending();
        if pending.is_empty() {
            return Err(AppError::Parse("Importer: No profiles found".into()));
        }

        let mut imported = Vec::new();
        let mut last_err = None;
        for item in pending {
            match self.import_one(mgr, &item).await {
                Ok(p) => imported.push(p),
                Err(e) => {
                    error!(path = %item.path, "Import failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        match (imported.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(imported),
        }
    }

    async fn import_one<S: ServiceApi>(&self, mgr: &ProfileManager<S>, item: &Pending) -> Result<Profile> {
        let parent = Path::new(&item.path).parent().unwrap_or(Path::new(""));
        let mut files = KeyFiles::new(self.origin_dir.join(parent));
        files.files = self.files.clone().into_iter().collect();
        let raw = item.raw.clone();
        let doc = tokio::task::spawn_blocking(move || ConfigDocument::parse_with_files(&raw, &files))
            .await
            .map_err(|e| AppError::Process(format!("Document parser: {}", e)))??;

        let meta = match (&doc.metadata, &item.companion) {
            (Some(meta), _) => meta.clone(),
            (None, Some(meta)) => meta.clone(),
            (None, None) => {
                warn!(path = %item.path, "No profile metadata, naming after file");
                ProfileMeta { name: Some(stem(&item.path)), ..Default::default() }
            }
        };
        let profile = mgr.import_document(&meta, &doc.serialize()).await?;
        info!(profile_id = %profile.id, path = %item.path, "Profile imported");
        Ok(profile)
    }
}

fn read_tar(path: &Path) -> Result<Vec<(String, String)>> {
    let file = std::fs::File::open(path)
        .map_err(|e| AppError::Read(format!("{}: {}", path.display(), e)))?;
    let mut archive = tar::Archive::new(file);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().to_string();
        let mut data = String::new();
        if let Err(e) = std::io::Read::read_to_string(&mut entry, &mut data) {
            warn!(member = %name, "Skipping unreadable tar member: {}", e);
            continue;
        }
        out.push((name, data));
    }
    Ok(out)
}

// ── Entry points ──────────────────────────────────────────────────────────────

/// Import one or more files. `.ovpn`/`.conf` files passed together can pair
/// up (`a.conf` JSON metadata for `a.ovpn`).
pub async fn import_files<S: ServiceApi>(mgr: &ProfileManager<S>, paths: &[PathBuf]) -> Result<Vec<Profile>> {
    let origin = paths
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut set = ImportSet::new(origin);

    for path in paths {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| AppError::Read(format!("{}: {}", path.display(), e)))?
            .len();
        if size > MAX_IMPORT_SIZE {
            return Err(AppError::Read(format!("Importer: File too large ({})", path.display())));
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("ovpn") | Some("conf") => set.add_path(path).await?,
            Some("tar") => set.add_tar(path).await?,
            _ => {
                return Err(AppError::Parse(format!(
                    "Importer: Unsupported file type ({})",
                    path.display()
                )))
            }
        }
    }
    set.import(mgr).await
}

fn is_ip_literal(uri: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}|\[[a-fA-F0-9:]*\]").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(uri))
}

/// Normalize a profile URI. Returns the URL and whether certificates are
/// verified (not for IP literal hosts).
pub fn normalize_uri(uri: &str) -> Result<(Url, bool)> {
    let uri = uri.trim();
    let mut uri = if let Some(rest) = uri.strip_prefix("pritunl:") {
        format!("https:{}", rest)
    } else if let Some(rest) = uri.strip_prefix("pts:") {
        format!("https:{}", rest)
    } else if uri.starts_with("http:") || uri.starts_with("https:") {
        uri.to_string()
    } else {
        format!("https://{}", uri)
    };
    uri = uri.replacen("/k/", "/ku/", 1);

    let strict = !is_ip_literal(&uri);
    let url = Url::parse(&uri).map_err(|e| AppError::Parse(format!("Invalid profile URI: {}", e)))?;
    Ok((url, strict))
}

pub async fn import_uri<S: ServiceApi>(mgr: &ProfileManager<S>, uri: &str) -> Result<Vec<Profile>> {
    let (url, strict) = normalize_uri(uri)?;
    let client = reqwest::Client::builder()
        .timeout(URI_TIMEOUT)
        .danger_accept_invalid_certs(!strict)
        .build()?;

    let mut target = url.clone();
    target.set_query(None);
    target.set_fragment(None);
    let resp = client
        .get(target.as_str())
        .header("User-Agent", "pritunl")
        .header("Accept", "application/json")
        .send()
        .await?;

    match resp.status().as_u16() {
        200 => {}
        404 => return Err(AppError::request("Invalid or expired profile URI")),
        status => return Err(AppError::request(format!("HTTP error status {} received", status))),
    }

    let body = resp.text().await?;
    let docs: BTreeMap<String, String> = serde_json::from_str(&body).unwrap_or_default();
    if docs.is_empty() {
        return Err(AppError::request("No data received from server"));
    }

    let mut imported = Vec::new();
    for (name, data) in docs {
        let mut set = ImportSet::new(PathBuf::new());
        set.add_data(name.clone(), data);
        match set.import(mgr).await {
            Ok(mut p) => imported.append(&mut p),
            Err(e) => error!(name = %name, "Import failed: {}", e),
        }
    }
    Ok(imported)
}
