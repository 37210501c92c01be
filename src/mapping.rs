//! On-device mapping store: fingerprint -> dbid, persisted as a JSON
//! sidecar file under `iPod_Control/iTunes/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Filename of the mapping sidecar, relative to `iPod_Control/iTunes/`.
pub const MAPPING_FILENAME: &str = "sync_mapping.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackMapping {
    pub dbid: u64,
    pub source_format: String,
    pub ipod_format: String,
    pub source_size: u64,
    pub source_mtime: f64,
    pub last_sync_iso: String,
    pub was_transcoded: bool,
    pub source_path_hint: Option<String>,
    pub art_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingFile {
    entries: HashMap<String, Vec<TrackMapping>>,
}

pub struct MappingManager {
    path: PathBuf,
    file: MappingFile,
}

impl MappingManager {
    /// Load the mapping sidecar rooted at `itunes_dir` (the directory that
    /// holds `iTunesDB`). A missing file starts empty; a file that fails to
    /// parse as JSON is backed up next to itself (`.json.bak`) and treated
    /// as empty rather than aborting the sync.
    pub fn load(itunes_dir: &Path) -> Result<Self, SyncError> {
        let path = itunes_dir.join(MAPPING_FILENAME);
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(parsed) => parsed,
                Err(_) => {
                    let backup = path.with_extension("json.bak");
                    let _ = std::fs::copy(&path, &backup);
                    MappingFile::default()
                }
            },
            Err(_) => MappingFile::default(),
        };
        Ok(MappingManager { path, file })
    }

    pub fn get_entries(&self, fingerprint: &str) -> &[TrackMapping] {
        self.file.entries.get(fingerprint).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn add(&mut self, fingerprint: &str, entry: TrackMapping) {
        self.file.entries.entry(fingerprint.to_string()).or_default().push(entry);
    }

    pub fn remove(&mut self, fingerprint: &str, dbid: u64) {
        if let Some(entries) = self.file.entries.get_mut(fingerprint) {
            entries.retain(|e| e.dbid != dbid);
            if entries.is_empty() {
                self.file.entries.remove(fingerprint);
            }
        }
    }

    pub fn remove_by_dbid(&mut self, dbid: u64) {
        let mut empty_keys = Vec::new();
        for (fp, entries) in self.file.entries.iter_mut() {
            entries.retain(|e| e.dbid != dbid);
            if entries.is_empty() {
                empty_keys.push(fp.clone());
            }
        }
        for fp in empty_keys {
            self.file.entries.remove(&fp);
        }
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.file.entries.keys().map(|s| s.as_str())
    }

    pub fn all_dbids(&self) -> impl Iterator<Item = u64> + '_ {
        self.file.entries.values().flatten().map(|e| e.dbid)
    }

    /// Atomically persist the mapping: write-temp-then-rename. Callers must
    /// only call this after the paired database rewrite has succeeded.
    pub fn save(&self) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(dbid: u64) -> TrackMapping {
        TrackMapping {
            dbid,
            source_format: "mp3".into(),
            ipod_format: "mp3".into(),
            source_size: 1234,
            source_mtime: 100.0,
            last_sync_iso: "2026-07-28T00:00:00Z".into(),
            was_transcoded: false,
            source_path_hint: Some("Queen/song.mp3".into()),
            art_hash: None,
        }
    }

    #[test]
    fn roundtrips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = MappingManager::load(dir.path()).unwrap();
        mgr.add("fp1", sample_entry(42));
        mgr.save().unwrap();

        let reloaded = MappingManager::load(dir.path()).unwrap();
        assert_eq!(reloaded.get_entries("fp1").len(), 1);
        assert_eq!(reloaded.get_entries("fp1")[0].dbid, 42);
    }

    #[test]
    fn corrupt_json_is_backed_up_and_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MAPPING_FILENAME), b"{not json").unwrap();
        let mgr = MappingManager::load(dir.path()).unwrap();
        assert_eq!(mgr.get_entries("anything").len(), 0);
        assert!(dir.path().join("sync_mapping.json.bak").exists());
    }

    #[test]
    fn remove_by_dbid_searches_all_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = MappingManager::load(dir.path()).unwrap();
        mgr.add("fp1", sample_entry(1));
        mgr.add("fp2", sample_entry(2));
        mgr.remove_by_dbid(1);
        assert_eq!(mgr.get_entries("fp1").len(), 0);
        assert_eq!(mgr.get_entries("fp2").len(), 1);
    }
}
