//! Persisted mapping from source document to generated artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::container::write_artifact;
use crate::error::{LessoncastError, Result};

/// Metadata for one generated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub output_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub size_bytes: u64,
    pub token_count: u64,
    pub chunk_count: usize,
    pub duration_seconds: f64,
    pub generated_at: DateTime<Utc>,
}

/// Document id to entry, kept sorted so the file diffs cleanly.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// `{prefix}/{file_name}` with exactly one slash between them.
pub fn public_url(prefix: &str, file_name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), file_name.trim_start_matches('/'))
}

/// Where the manifest lives.
pub trait ManifestStore: Send + Sync {
    fn load(&self) -> Result<Manifest>;

    fn save(&self, manifest: &Manifest) -> Result<()>;

    /// Re-read the stored manifest, overwrite only the `touched` keys and
    /// save. Entries written by other runs in the meantime survive.
    fn merge(&self, touched: &Manifest) -> Result<Manifest> {
        overlay(self, touched)
    }
}

fn overlay<S: ManifestStore + ?Sized>(store: &S, touched: &Manifest) -> Result<Manifest> {
    let mut current = store.load()?;
    for (id, entry) in touched {
        current.insert(id.clone(), entry.clone());
    }
    store.save(&current)?;
    Ok(current)
}

/// Held across the load and save of a file merge so that stores in one
/// process pointing at the same file cannot drop each other's entries.
static FILE_MERGE: Mutex<()> = Mutex::new(());

/// Pretty-printed JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonManifestStore {
    path: PathBuf,
}

impl JsonManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManifestStore for JsonManifestStore {
    fn load(&self) -> Result<Manifest> {
        if !self.path.exists() {
            return Ok(Manifest::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Manifest::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            LessoncastError::Manifest(format!("{} is not a valid manifest: {}", self.path.display(), e))
        })
    }

    fn save(&self, manifest: &Manifest) -> Result<()> {
        let mut json = serde_json::to_string_pretty(manifest)?;
        json.push('\n');
        write_artifact(&self.path, json.as_bytes())?;
        debug!(path = %self.path.display(), entries = manifest.len(), "manifest saved");
        Ok(())
    }

    fn merge(&self, touched: &Manifest) -> Result<Manifest> {
        let _guard = FILE_MERGE.lock().unwrap_or_else(PoisonError::into_inner);
        overlay(self, touched)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    entries: Mutex<Manifest>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Manifest) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn snapshot(&self) -> Manifest {
        self.load().unwrap_or_default()
    }
}

impl ManifestStore for MemoryManifestStore {
    fn load(&self) -> Result<Manifest> {
        self.entries
            .lock()
            .map(|m| m.clone())
            .map_err(|_| LessoncastError::Manifest("manifest lock poisoned".to_string()))
    }

    fn save(&self, manifest: &Manifest) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LessoncastError::Manifest("manifest lock poisoned".to_string()))?;
        *entries = manifest.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(path: &str) -> ManifestEntry {
        ManifestEntry {
            output_path: path.to_string(),
            url: Some(public_url("/audio/", path)),
            size_bytes: 1024,
            token_count: 300,
            chunk_count: 2,
            duration_seconds: 12.5,
            generated_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn manifest(ids: &[&str]) -> Manifest {
        ids.iter()
            .map(|id| (id.to_string(), entry(&format!("{id}.wav"))))
            .collect()
    }

    #[test]
    fn test_public_url() {
        assert_eq!(public_url("/audio/", "/a.wav"), "/audio/a.wav");
        assert_eq!(public_url("https://cdn.example", "a.wav"), "https://cdn.example/a.wav");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonManifestStore::new(dir.path().join("manifest.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_round_trip_uses_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonManifestStore::new(dir.path().join("out").join("manifest.json"));
        store.save(&manifest(&["intro"])).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"generated_at\": \"2025-03-01T12:00:00Z\""));
        assert!(raw.contains("\"url\": \"/audio/intro.wav\""));
        assert_eq!(store.load().unwrap(), manifest(&["intro"]));
    }

    #[test]
    fn test_merge_keeps_unrelated_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let ours = JsonManifestStore::new(&path);
        ours.save(&manifest(&["a", "b"])).unwrap();

        // Another run writes "c" after we loaded.
        let _stale = ours.load().unwrap();
        let theirs = JsonManifestStore::new(&path);
        theirs.merge(&manifest(&["c"])).unwrap();

        let mut touched = Manifest::new();
        let mut updated = entry("a-v2.wav");
        updated.chunk_count = 9;
        touched.insert("a".to_string(), updated.clone());
        let merged = ours.merge(&touched).unwrap();

        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(merged["a"], updated);
        assert_eq!(ours.load().unwrap(), merged);
    }

    #[test]
    fn test_parallel_merges_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let path = &path;
                scope.spawn(move || {
                    let store = JsonManifestStore::new(path);
                    for n in 0..50 {
                        let id = format!("w{worker}-{n}");
                        store.merge(&manifest(&[id.as_str()])).unwrap();
                    }
                });
            }
        });

        let merged = JsonManifestStore::new(&path).load().unwrap();
        assert_eq!(merged.len(), 200);
        assert!(merged.contains_key("w0-0") && merged.contains_key("w3-49"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, "{ not json").unwrap();
        let err = JsonManifestStore::new(&path).load().unwrap_err();
        assert!(matches!(err, LessoncastError::Manifest(_)));
    }

    #[test]
    fn test_memory_store_merge() {
        let store = MemoryManifestStore::with_entries(manifest(&["x"]));
        store.merge(&manifest(&["y"])).unwrap();
        assert_eq!(store.snapshot().len(), 2);
    }
}
