//! The profile document: tunnel directives, an optional `#{ … #}` metadata
//! block and inline key sections (`<ca>`, `<tls-auth>`, …).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::ProfileMeta;
use crate::sync;

const UV_ID: &str = "setenv UV_ID ";
const UV_NAME: &str = "setenv UV_NAME ";

// ── Key sections ──────────────────────────────────────────────────────────────

/// Inline key section tags. Declaration order is the serialization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyTag {
    Ca,
    TlsAuth,
    TlsCrypt,
    Cert,
    Key,
}

impl KeyTag {
    pub const ALL: [KeyTag; 5] = [Self::Ca, Self::TlsAuth, Self::TlsCrypt, Self::Cert, Self::Key];
    /// Sections moved into sealed storage.
    pub const SEALED: [KeyTag; 3] = [Self::TlsAuth, Self::TlsCrypt, Self::Key];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ca       => "ca",
            Self::TlsAuth  => "tls-auth",
            Self::TlsCrypt => "tls-crypt",
            Self::Cert     => "cert",
            Self::Key      => "key",
        }
    }

    pub fn open(&self) -> String {
        format!("<{}>", self.as_str())
    }

    pub fn close(&self) -> String {
        format!("</{}>", self.as_str())
    }

    fn from_open(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| line == t.open())
    }

    /// Split a file-reference directive such as `tls-auth ta.key 1` into its
    /// tag and argument string.
    fn from_directive(line: &str) -> Option<(Self, &str)> {
        Self::ALL.into_iter().find_map(|t| {
            line.strip_prefix(t.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
                .map(|arg| (t, arg.trim()))
        })
    }
}

/// Files a document may reference by path: an in-memory map (tar members,
/// URI payloads) consulted first, then the directory of the source file.
#[derive(Debug, Clone, Default)]
pub struct KeyFiles {
    pub files: HashMap<String, String>,
    pub base_dir: PathBuf,
}

impl KeyFiles {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { files: HashMap::new(), base_dir: base_dir.into() }
    }

    fn resolve(&self, path: &str) -> Result<String> {
        if let Some(data) = self.files.get(path) {
            return Ok(data.clone());
        }
        let full = self.base_dir.join(Path::new(path));
        std::fs::read_to_string(&full)
            .map_err(|e| AppError::Read(format!("{}: {}", full.display(), e)))
    }
}

// ── Document ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    pub directives: Vec<String>,
    pub metadata: Option<ProfileMeta>,
    pub key_direction: Option<String>,
    /// Section bodies without their tags, each ending in a newline.
    pub blocks: BTreeMap<KeyTag, String>,
}

impl ConfigDocument {
    /// Parse without touching the filesystem. File-reference directives are
    /// kept as plain directives.
    pub fn parse(raw: &str) -> Self {
        match Self::parse_inner(raw, None) {
            Ok(doc) => doc,
            // only file resolution can fail
            Err(_) => Self::default(),
        }
    }

    /// Parse and inline every `ca`/`cert`/`key`/`tls-auth`/`tls-crypt` file
    /// reference. Blocking file reads.
    pub fn parse_with_files(raw: &str, files: &KeyFiles) -> Result<Self> {
        Self::parse_inner(raw, Some(files))
    }

    fn parse_inner(raw: &str, files: Option<&KeyFiles>) -> Result<Self> {
        let text = raw.replace('\r', "");
        let mut doc = Self::default();
        let mut meta_found: Option<bool> = None;
        let mut meta_json = String::new();
        let mut open: Option<(KeyTag, String)> = None;

        for line in text.split('\n') {
            if let Some((tag, mut body)) = open.take() {
                if line.trim() == tag.close() {
                    doc.blocks.insert(tag, body);
                } else {
                    body.push_str(line);
                    body.push('\n');
                    open = Some((tag, body));
                }
                continue;
            }

            if meta_found.is_none() && line == "#{" {
                meta_found = Some(true);
            }
            if meta_found == Some(true) && line.starts_with('#') {
                if line == "#}" {
                    meta_found = Some(false);
                }
                meta_json.push_str(&line[1..]);
                continue;
            }

            let line = line.trim_end();
            if let Some(tag) = KeyTag::from_open(line.trim_start()) {
                open = Some((tag, String::new()));
                continue;
            }
            if let Some(dir) = line.strip_prefix("key-direction ") {
                doc.key_direction = Some(dir.trim().to_string());
                continue;
            }
            if let (Some(files), Some((tag, arg))) = (files, KeyTag::from_directive(line)) {
                let mut path = arg;
                if tag == KeyTag::TlsAuth {
                    if let Some((p, dir)) = arg.rsplit_once(' ') {
                        if dir.parse::<u8>().is_ok() {
                            doc.key_direction = Some(dir.to_string());
                            path = p.trim_end();
                        }
                    }
                }
                let mut body = files.resolve(path)?;
                if !body.ends_with('\n') {
                    body.push('\n');
                }
                doc.blocks.insert(tag, body);
                continue;
            }
            doc.directives.push(line.to_string());
        }

        // unterminated section, keep the text rather than lose it
        if let Some((tag, body)) = open {
            debug!(tag = tag.as_str(), "Unterminated key section");
            doc.directives.push(tag.open());
            doc.directives.extend(body.lines().map(str::to_string));
        }

        while doc.directives.first().is_some_and(|l| l.is_empty()) {
            doc.directives.remove(0);
        }
        while doc.directives.last().is_some_and(|l| l.is_empty()) {
            doc.directives.pop();
        }

        if !meta_json.is_empty() {
            match serde_json::from_str::<ProfileMeta>(&meta_json) {
                Ok(meta) => doc.metadata = Some(meta),
                Err(e) => warn!("Document metadata ignored: {}", e),
            }
        }
        Ok(doc)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for line in &self.directives {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        if let Some(dir) = &self.key_direction {
            out.push_str(&format!("key-direction {}\n", dir));
        }
        for (tag, body) in &self.blocks {
            if body.trim().is_empty() {
                continue;
            }
            out.push_str(&tag.open());
            out.push('\n');
            out.push_str(body);
            out.push_str(&tag.close());
            out.push('\n');
        }
        out
    }

    fn find_line(&self, prefix: &str) -> Option<&String> {
        self.directives.iter().find(|l| l.starts_with(prefix))
    }

    /// Value of the `setenv UV_NAME` directive, if any.
    pub fn uv_name(&self) -> Option<String> {
        self.find_line(UV_NAME)
            .map(|l| l[UV_NAME.len()..].trim().to_string())
            .filter(|n| !n.is_empty())
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directive_args(name).is_some()
    }

    /// Arguments of the first directive named `name`, `Some("")` when the
    /// directive has none.
    pub fn directive_args(&self, name: &str) -> Option<&str> {
        self.directives.iter().find_map(|l| {
            let l = l.trim();
            match l.strip_prefix(name) {
                Some("") => Some(""),
                Some(rest) if rest.starts_with(' ') => Some(rest.trim()),
                _ => None,
            }
        })
    }

    /// Apply a signed remote configuration on top of this document.
    ///
    /// On a signature mismatch `self` is left as is and `AppError::Signature`
    /// is returned; nothing from the remote body is applied.
    pub fn merge(&self, profile_id: &str, remote_conf: &str, secret: &str, signature: &str) -> Result<Self> {
        if !sync::verify_signature(secret, remote_conf, signature) {
            return Err(AppError::Signature(profile_id.to_string()));
        }
        let remote = Self::parse(remote_conf);

        let local_id = self.find_line(UV_ID).cloned();
        let local_name = self.find_line(UV_NAME).cloned();
        let mut directives: Vec<String> = remote
            .directives
            .into_iter()
            .map(|line| {
                if line.starts_with(UV_ID) {
                    local_id.clone().unwrap_or(line)
                } else if line.starts_with(UV_NAME) {
                    local_name.clone().unwrap_or(line)
                } else {
                    line
                }
            })
            .collect();
        for (prefix, local) in [(UV_ID, &local_id), (UV_NAME, &local_name)] {
            if let Some(local) = local {
                if !directives.iter().any(|l| l.starts_with(prefix)) {
                    directives.push(local.clone());
                }
            }
        }

        let key_direction = match (remote.key_direction, &self.key_direction) {
            (Some(dir), _) => Some(dir),
            (None, Some(_)) => Some("1".to_string()),
            (None, None) => None,
        };

        let mut blocks = self.blocks.clone();
        blocks.extend(remote.blocks);

        Ok(Self {
            directives,
            metadata: remote.metadata,
            key_direction,
            blocks,
        })
    }
}

// ── Sealed key material ───────────────────────────────────────────────────────

/// Remove the first `<tls-auth>`, `<tls-crypt>` and `<key>` sections from a
/// document text. Returns the stripped text and the removed sections
/// concatenated.
pub fn extract_key_blocks(text: &str) -> (String, String) {
    let mut stripped = text.to_string();
    let mut material = String::new();
    for tag in KeyTag::SEALED {
        let (open, close) = (tag.open(), tag.close());
        let Some(start) = stripped.find(&open) else { continue };
        let Some(close_at) = stripped[start..].find(&close) else { continue };
        let mut end = start + close_at + close.len();
        material.push_str(&stripped[start..end]);
        material.push('\n');
        if stripped[end..].starts_with('\n') {
            end += 1;
        }
        stripped.replace_range(start..end, "");
    }
    (stripped, material)
}

/// Inverse of [`extract_key_blocks`].
pub fn full_data(stripped: &str, key_material: &str) -> String {
    if key_material.is_empty() {
        return stripped.to_string();
    }
    let mut out = stripped.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(key_material);
    out
}
