//! Storage roots registry and path resolution.
//!
//! Catalog records store paths relative to a logical root key so the library
//! can span several disks. The registry maps each key to one authoritative
//! directory and optionally holds a fallback root for records that predate
//! root keys. Resolution is pure path arithmetic and never touches the disk.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Single-root override keys and the root key each one populates.
pub const SINGLE_ROOT_KEYS: &[(&str, &str)] = &[
    ("MOVIES_ROOT", "movies"),
    ("AUDIOBOOKS_ROOT", "audiobooks"),
    ("EBOOKS_ROOT", "ebooks"),
];

/// Root definitions gathered from configuration.
#[derive(Debug, Clone, Default)]
pub struct RootsConfig {
    /// Multi-root mapping, `key:/abs/path,key2:/abs/path2`.
    pub roots_mapping: Option<String>,
    /// Single overrides as `(root_key, path)` pairs.
    pub single_roots: Vec<(String, PathBuf)>,
    pub fallback_root: Option<PathBuf>,
}

/// A registered root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootEntry {
    pub root_key: String,
    pub absolute_path: PathBuf,
}

/// A persisted root definition; the first directory is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRootRecord {
    pub root_key: String,
    pub directories: Vec<PathBuf>,
}

/// Where a media file lives, as stored on its catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoLocation {
    pub root_key: Option<String>,
    pub relative_path: String,
}

impl VideoLocation {
    pub fn new(root_key: Option<&str>, relative_path: impl Into<String>) -> Self {
        Self {
            root_key: root_key.filter(|k| !k.is_empty()).map(str::to_string),
            relative_path: relative_path.into(),
        }
    }
}

#[derive(Debug, Default)]
struct RootsState {
    roots: BTreeMap<String, PathBuf>,
    fallback: Option<PathBuf>,
}

/// Thread-safe registry of storage roots, shared as `Arc<RootsRegistry>`.
#[derive(Debug, Default)]
pub struct RootsRegistry {
    state: RwLock<RootsState>,
}

impl RootsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration in one step.
    pub fn from_config(config: &RootsConfig) -> Self {
        let registry = Self::new();
        registry.init(config);
        registry
    }

    /// Clears the registry and rebuilds it from configuration.
    ///
    /// Sources apply in order: the multi-root mapping, then single-root
    /// overrides, then the fallback root. A key already set by an earlier
    /// source is kept.
    pub fn init(&self, config: &RootsConfig) {
        let mut state = RootsState::default();

        if let Some(mapping) = config.roots_mapping.as_deref() {
            for (key, path) in parse_roots_mapping(mapping) {
                state.roots.entry(key).or_insert(path);
            }
        }

        for (key, path) in &config.single_roots {
            if !path.is_absolute() {
                tracing::warn!(root_key = %key, path = %path.display(), "Ignoring relative root path");
                continue;
            }
            state
                .roots
                .entry(key.clone())
                .or_insert_with(|| path.clone());
        }

        state.fallback = config.fallback_root.clone();

        tracing::info!(
            roots = state.roots.len(),
            fallback = state.fallback.is_some(),
            "Roots registry initialized"
        );

        *self.write() = state;
    }

    /// Registers or replaces the authoritative path for a key.
    pub fn register_root(&self, root_key: &str, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::debug!(root_key, path = %path.display(), "Registering root");
        self.write().roots.insert(root_key.to_string(), path);
    }

    /// Merges persisted root definitions without overwriting existing keys.
    ///
    /// Returns how many keys were added.
    pub fn register_from_db(&self, records: &[StorageRootRecord]) -> usize {
        let mut state = self.write();
        let mut added = 0;
        for record in records {
            let Some(first) = record.directories.first() else {
                tracing::warn!(root_key = %record.root_key, "Persisted root has no directories");
                continue;
            };
            if state.roots.contains_key(&record.root_key) {
                continue;
            }
            state.roots.insert(record.root_key.clone(), first.clone());
            added += 1;
        }
        added
    }

    /// Returns the directory registered for a key.
    pub fn root_path(&self, root_key: &str) -> Option<PathBuf> {
        self.read().roots.get(root_key).cloned()
    }

    pub fn fallback_root(&self) -> Option<PathBuf> {
        self.read().fallback.clone()
    }

    /// Lists registered roots sorted by key.
    pub fn list_roots(&self) -> Vec<RootEntry> {
        self.read()
            .roots
            .iter()
            .map(|(key, path)| RootEntry {
                root_key: key.clone(),
                absolute_path: path.clone(),
            })
            .collect()
    }

    /// Resolves the absolute path of a media file.
    ///
    /// Keyless locations resolve against the fallback root. A key that is not
    /// registered does not fall back. Paths escaping their root with `..`
    /// never resolve.
    pub fn resolve_video_path(&self, location: &VideoLocation) -> Option<PathBuf> {
        let relative = sanitize_relative(&location.relative_path)?;
        let state = self.read();
        let base = match location.root_key.as_deref() {
            Some(key) => state.roots.get(key)?,
            None => state.fallback.as_ref()?,
        };
        Some(base.join(relative))
    }

    /// Resolves the directory that contains a media file.
    pub fn resolve_video_dir(&self, location: &VideoLocation) -> Option<PathBuf> {
        self.resolve_video_path(location)
            .and_then(|p| p.parent().map(Path::to_path_buf))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RootsState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RootsState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parses `key:/abs/path,key2:/abs/path2`, skipping malformed entries.
pub fn parse_roots_mapping(mapping: &str) -> Vec<(String, PathBuf)> {
    let mut roots = Vec::new();
    for entry in mapping.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match parse_root_entry(entry) {
            Ok(root) => roots.push(root),
            Err(e) => tracing::warn!("{}", e),
        }
    }
    roots
}

fn parse_root_entry(entry: &str) -> Result<(String, PathBuf), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidRootEntry {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let (key, path) = entry
        .split_once(':')
        .ok_or_else(|| invalid("expected key:/path"))?;
    let key = key.trim();
    let path = PathBuf::from(path.trim());

    if key.is_empty() {
        return Err(invalid("empty root key"));
    }
    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    Ok((key.to_string(), path))
}

/// Strips leading separators and rejects parent or prefix components and
/// paths that name nothing below the root.
fn sanitize_relative(relative: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}
