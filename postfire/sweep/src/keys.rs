//! Structured sweep keys and the stores that hold configuration artifacts under them.
//!
//! A combination's `path` (e.g. `growth/high/removal-12`) is parsed into a
//! [`SweepKey`] once. Everything downstream addresses artifacts and results through
//! the key, so the nested-directory layout is just one [`ArtifactStore`] backend.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Component, Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, params::ConfigArtifact};

/// File name of a generated artifact inside its key directory.
pub const ARTIFACT_FILE_NAME: &str = "params.jshc";

const STEM_SEPARATOR: &str = "__";

/// Validated, slash-delimited identifier of one parameter combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SweepKey {
    segments: Vec<String>,
}

impl SweepKey {
    /// Parses a raw path. Surrounding whitespace and a trailing slash are tolerated;
    /// absolute paths, empty segments, `.`/`..` and backslashes are refused.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidKey {
            key: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if trimmed.starts_with('/') {
            return Err(invalid("absolute paths are not allowed"));
        }
        if trimmed.contains('\\') {
            return Err(invalid("use '/' as the segment separator"));
        }
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            match segment {
                "" => return Err(invalid("empty path segment")),
                "." | ".." => return Err(invalid("relative segments are not allowed")),
                other if other.contains(STEM_SEPARATOR) => {
                    return Err(invalid("segments may not contain '__'"))
                }
                other => segments.push(other.to_string()),
            }
        }
        Ok(Self { segments })
    }

    /// Builds a key from a path relative to a store root.
    pub fn from_relative_path(path: &Path) -> Result<Self, ConfigError> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                _ => {
                    return Err(ConfigError::InvalidKey {
                        key: path.display().to_string(),
                        reason: "not a plain relative path",
                    })
                }
            }
        }
        Self::parse(&parts.join("/"))
    }

    /// Path segments in order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Relative filesystem path mirroring the segments.
    #[must_use]
    pub fn to_relative_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Flat, filesystem-safe name used for relocated results (`a/b` -> `a__b`).
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.segments.join(STEM_SEPARATOR)
    }

    /// True when `selector` equals this key or is a whole-segment prefix of it.
    #[must_use]
    pub fn matches_selector(&self, selector: &Self) -> bool {
        self.segments.starts_with(&selector.segments)
    }
}

impl fmt::Display for SweepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl TryFrom<String> for SweepKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SweepKey> for String {
    fn from(key: SweepKey) -> Self {
        key.to_string()
    }
}

/// Storage backend for configuration artifacts addressed by [`SweepKey`].
pub trait ArtifactStore: Send + Sync {
    /// Writes (or overwrites) the artifact for `key`.
    fn put(&self, key: &SweepKey, artifact: &ConfigArtifact) -> Result<(), ConfigError>;
    /// Reads the artifact for `key`, if present.
    fn get(&self, key: &SweepKey) -> Result<Option<ConfigArtifact>, ConfigError>;
    /// Every key currently holding an artifact, sorted.
    fn keys(&self) -> Result<Vec<SweepKey>, ConfigError>;
    /// Removes the artifact for `key`. Returns whether anything was removed.
    fn remove(&self, key: &SweepKey) -> Result<bool, ConfigError>;
    /// Filesystem location of the artifact, for backends that have one.
    fn locate(&self, _key: &SweepKey) -> Option<PathBuf> {
        None
    }
}

/// Nested-directory store: `<root>/<segment>/.../params.jshc`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root` (created lazily on first write).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &SweepKey) -> PathBuf {
        self.root
            .join(key.to_relative_path())
            .join(ARTIFACT_FILE_NAME)
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<SweepKey>) -> Result<(), ConfigError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if path.join(ARTIFACT_FILE_NAME).is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        match SweepKey::from_relative_path(relative) {
                            Ok(key) => keys.push(key),
                            Err(err) => tracing::warn!(
                                path = %path.display(),
                                "skipping artifact directory: {err}"
                            ),
                        }
                    }
                }
                self.collect_keys(&path, keys)?;
            }
        }
        Ok(())
    }

    /// Removes empty directories from `start` upwards, stopping before the root.
    fn prune_empty_parents(&self, start: &Path) -> io::Result<()> {
        let mut current = start.to_path_buf();
        while current != self.root && current.starts_with(&self.root) {
            let is_empty = fs::read_dir(&current)?.next().is_none();
            if !is_empty {
                break;
            }
            fs::remove_dir(&current)?;
            if !current.pop() {
                break;
            }
        }
        Ok(())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &SweepKey, artifact: &ConfigArtifact) -> Result<(), ConfigError> {
        let path = self.artifact_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, artifact.render())?;
        Ok(())
    }

    fn get(&self, key: &SweepKey) -> Result<Option<ConfigArtifact>, ConfigError> {
        let path = self.artifact_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(ConfigArtifact::load(&path)?))
    }

    fn keys(&self) -> Result<Vec<SweepKey>, ConfigError> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &SweepKey) -> Result<bool, ConfigError> {
        let path = self.artifact_path(key);
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        if let Some(dir) = path.parent() {
            self.prune_empty_parents(dir)?;
        }
        Ok(true)
    }

    fn locate(&self, key: &SweepKey) -> Option<PathBuf> {
        Some(self.artifact_path(key))
    }
}

/// In-memory store for alternate backends and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<SweepKey, ConfigArtifact>>,
}

impl MemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, key: &SweepKey, artifact: &ConfigArtifact) -> Result<(), ConfigError> {
        self.artifacts.lock().insert(key.clone(), artifact.clone());
        Ok(())
    }

    fn get(&self, key: &SweepKey) -> Result<Option<ConfigArtifact>, ConfigError> {
        Ok(self.artifacts.lock().get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<SweepKey>, ConfigError> {
        Ok(self.artifacts.lock().keys().cloned().collect())
    }

    fn remove(&self, key: &SweepKey) -> Result<bool, ConfigError> {
        Ok(self.artifacts.lock().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(raw: &str) -> SweepKey {
        SweepKey::parse(raw).unwrap()
    }

    #[test]
    fn parses_segments_and_stem() {
        let parsed = key(" growth/high/removal-12/ ");
        assert_eq!(parsed.segments().len(), 3);
        assert_eq!(parsed.to_string(), "growth/high/removal-12");
        assert_eq!(parsed.file_stem(), "growth__high__removal-12");
    }

    #[test]
    fn refuses_escaping_paths() {
        for raw in ["/etc", "a/../b", "a//b", "./a", "a\\b", "a__b"] {
            assert!(
                matches!(SweepKey::parse(raw), Err(ConfigError::InvalidKey { .. })),
                "{raw} should be rejected"
            );
        }
        assert!(matches!(SweepKey::parse("  "), Err(ConfigError::EmptyPath)));
    }

    #[test]
    fn selector_matches_whole_segments_only() {
        let full = key("growth/high");
        assert!(full.matches_selector(&key("growth")));
        assert!(full.matches_selector(&key("growth/high")));
        assert!(!full.matches_selector(&key("grow")));
        assert!(!full.matches_selector(&key("growth/high/extra")));
    }

    #[test]
    fn fs_store_lists_nested_keys() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("sweep"));
        let artifact = ConfigArtifact::parse("growthRate = 5 percent\n");
        store.put(&key("b/two"), &artifact).unwrap();
        store.put(&key("a"), &artifact).unwrap();
        store.put(&key("a/nested"), &artifact).unwrap();

        let keys: Vec<String> = store.keys().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["a", "a/nested", "b/two"]);
        let loaded = store.get(&key("b/two")).unwrap().unwrap();
        assert_eq!(loaded.get("growthRate").unwrap().value, "5");
    }

    #[test]
    fn fs_remove_keeps_undeclared_neighbours() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("sweep");
        let store = FsArtifactStore::new(&root);
        let artifact = ConfigArtifact::parse("x = 1\n");
        store.put(&key("a"), &artifact).unwrap();
        store.put(&key("a/nested"), &artifact).unwrap();
        store.put(&key("c/d"), &artifact).unwrap();

        assert!(store.remove(&key("a")).unwrap());
        assert!(store.remove(&key("c/d")).unwrap());
        assert!(!store.remove(&key("c/d")).unwrap());

        assert!(root.join("a/nested").join(ARTIFACT_FILE_NAME).is_file());
        assert!(!root.join("c").exists());
        assert!(root.exists());
    }
}
