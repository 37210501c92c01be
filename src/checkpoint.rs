//! Checkpoint manager: point-in-time backups of the database and mapping
//! file, so an interrupted or failed sync can be detected and rolled back.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::mapping::MAPPING_FILENAME;

pub const MAX_CHECKPOINTS: usize = 3;
const CHECKPOINT_SUBDIR: &str = ".ipod-classic-sync";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub started_at: String,
    pub completed_stages: Vec<String>,
    pub current_stage: String,
    pub tracks_added: u32,
    pub tracks_removed: u32,
    pub tracks_updated: u32,
    pub last_error: String,
    pub is_complete: bool,
    pub is_failed: bool,
}

impl SyncState {
    pub fn mark_stage_started(&mut self, stage: &str) {
        self.current_stage = stage.to_string();
    }

    pub fn mark_stage_complete(&mut self, stage: &str) {
        if !self.completed_stages.iter().any(|s| s == stage) {
            self.completed_stages.push(stage.to_string());
        }
        self.current_stage.clear();
    }
}

pub struct CheckpointManager {
    mount: PathBuf,
    checkpoint_base: PathBuf,
    current_checkpoint: Option<PathBuf>,
    state: Option<SyncState>,
}

impl CheckpointManager {
    pub fn new(mount: &Path) -> Self {
        CheckpointManager {
            mount: mount.to_path_buf(),
            checkpoint_base: mount.join("iPod_Control").join(CHECKPOINT_SUBDIR),
            current_checkpoint: None,
            state: None,
        }
    }

    pub fn itunesdb_path(&self) -> PathBuf {
        self.mount.join("iPod_Control/iTunes/iTunesDB")
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.mount.join("iPod_Control/iTunes").join(MAPPING_FILENAME)
    }

    /// Snapshot `iTunesDB` and the mapping file, initialize a fresh
    /// `SyncState`, and prune checkpoints beyond `MAX_CHECKPOINTS`.
    pub fn create_checkpoint(&mut self, started_at: &str) -> bool {
        let checkpoint_dir = self.checkpoint_base.join(format!("checkpoint_{}", started_at));
        if std::fs::create_dir_all(&checkpoint_dir).is_err() {
            error!("failed to create checkpoint directory {}", checkpoint_dir.display());
            return false;
        }
        self.current_checkpoint = Some(checkpoint_dir.clone());

        if self.itunesdb_path().exists() {
            if let Err(e) = std::fs::copy(self.itunesdb_path(), checkpoint_dir.join("iTunesDB")) {
                error!("failed to back up iTunesDB: {}", e);
                return false;
            }
        }
        if self.mapping_path().exists() {
            if let Err(e) = std::fs::copy(self.mapping_path(), checkpoint_dir.join(MAPPING_FILENAME)) {
                error!("failed to back up mapping file: {}", e);
                return false;
            }
        }

        self.state = Some(SyncState { started_at: started_at.to_string(), ..Default::default() });
        self.save_state();
        self.prune_old_checkpoints();
        info!("created checkpoint: {}", checkpoint_dir.display());
        true
    }

    pub fn update_state(
        &mut self,
        stage: Option<&str>,
        stage_complete: bool,
        tracks_added: u32,
        tracks_removed: u32,
        tracks_updated: u32,
        error: Option<&str>,
    ) {
        let Some(state) = self.state.as_mut() else { return };
        if let Some(stage) = stage {
            if stage_complete {
                state.mark_stage_complete(stage);
            } else {
                state.mark_stage_started(stage);
            }
        }
        state.tracks_added += tracks_added;
        state.tracks_removed += tracks_removed;
        state.tracks_updated += tracks_updated;
        if let Some(err) = error {
            state.last_error = err.to_string();
            state.is_failed = true;
        }
        self.save_state();
    }

    pub fn mark_complete(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.is_complete = true;
            state.is_failed = false;
            state.current_stage.clear();
        }
        self.save_state();
        info!("sync completed successfully, checkpoint preserved for safety");
    }

    pub fn mark_failed(&mut self, error: &str) {
        if let Some(state) = self.state.as_mut() {
            state.is_failed = true;
            state.last_error = error.to_string();
        }
        self.save_state();
        warn!("sync failed: {}", error);
    }

    /// Restore `iTunesDB` and the mapping file from the most recent
    /// checkpoint.
    pub fn rollback(&mut self) -> bool {
        let Some(checkpoint) = self.find_latest_checkpoint() else {
            warn!("no checkpoint available for rollback");
            return false;
        };
        let backup_db = checkpoint.join("iTunesDB");
        if backup_db.exists() {
            if let Err(e) = std::fs::copy(&backup_db, self.itunesdb_path()) {
                error!("rollback failed restoring iTunesDB: {}", e);
                return false;
            }
        }
        let backup_mapping = checkpoint.join(MAPPING_FILENAME);
        if backup_mapping.exists() {
            if let Err(e) = std::fs::copy(&backup_mapping, self.mapping_path()) {
                error!("rollback failed restoring mapping: {}", e);
                return false;
            }
        }
        if let Some(state) = self.state.as_mut() {
            state.last_error = "rolled back to checkpoint".to_string();
        }
        self.save_state();
        info!("rolled back to checkpoint: {}", checkpoint.display());
        true
    }

    /// Returns a `SyncState` only if it reflects a failed or visibly
    /// interrupted (incomplete, non-empty current stage) prior run.
    pub fn get_last_failed_sync(&self) -> Option<SyncState> {
        let checkpoint = self.find_latest_checkpoint()?;
        let state_file = checkpoint.join("state.json");
        let contents = std::fs::read_to_string(state_file).ok()?;
        let state: SyncState = serde_json::from_str(&contents).ok()?;
        if state.is_failed || (!state.is_complete && !state.current_stage.is_empty()) {
            Some(state)
        } else {
            None
        }
    }

    fn save_state(&self) {
        let (Some(checkpoint), Some(state)) = (&self.current_checkpoint, &self.state) else { return };
        let state_file = checkpoint.join("state.json");
        if let Ok(json) = serde_json::to_string_pretty(state) {
            if let Err(e) = std::fs::write(&state_file, json) {
                warn!("could not save sync state: {}", e);
            }
        }
    }

    fn find_latest_checkpoint(&self) -> Option<PathBuf> {
        let mut checkpoints: Vec<PathBuf> = std::fs::read_dir(&self.checkpoint_base)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("checkpoint_"))
                        .unwrap_or(false)
            })
            .collect();
        checkpoints.sort();
        checkpoints.pop()
    }

    fn prune_old_checkpoints(&self) {
        let mut checkpoints: Vec<PathBuf> = match std::fs::read_dir(&self.checkpoint_base) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_dir()
                        && p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("checkpoint_"))
                            .unwrap_or(false)
                })
                .collect(),
            Err(_) => return,
        };
        checkpoints.sort();
        checkpoints.reverse();
        for old in checkpoints.into_iter().skip(MAX_CHECKPOINTS) {
            if let Err(e) = std::fs::remove_dir_all(&old) {
                warn!("could not remove old checkpoint {}: {}", old.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_checkpoint_backs_up_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("iPod_Control/iTunes")).unwrap();
        std::fs::write(dir.path().join("iPod_Control/iTunes/iTunesDB"), b"fake db").unwrap();

        let mut mgr = CheckpointManager::new(dir.path());
        assert!(mgr.create_checkpoint("20260728_120000"));

        let checkpoint_dir = mgr.checkpoint_base.join("checkpoint_20260728_120000");
        assert!(checkpoint_dir.join("iTunesDB").exists());
    }

    #[test]
    fn prune_keeps_only_max_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        for i in 0..5 {
            mgr.create_checkpoint(&format!("2026072{}_000000", i));
        }
        let remaining = std::fs::read_dir(&mgr.checkpoint_base).unwrap().count();
        assert_eq!(remaining, MAX_CHECKPOINTS);
    }

    #[test]
    fn get_last_failed_sync_returns_none_when_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        mgr.create_checkpoint("20260728_120000");
        mgr.mark_complete();
        assert!(mgr.get_last_failed_sync().is_none());
    }
}
