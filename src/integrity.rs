//! Integrity checker: reconciles the three sources of truth (iTunesDB,
//! mapping file, on-device filesystem) before the differ runs.

use std::path::Path;

use log::{info, warn};

use crate::itunesdb::TrackInfo;
use crate::mapping::MappingManager;

const AUDIO_EXTS: &[&str] =
    &["mp3", "m4a", "m4b", "m4p", "mp4", "aac", "wav", "aif", "aiff", "alac"];

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub missing_file_titles: Vec<String>,
    pub stale_mapping_dbids: Vec<u64>,
    pub orphan_files: Vec<std::path::PathBuf>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_file_titles.is_empty()
            && self.stale_mapping_dbids.is_empty()
            && self.orphan_files.is_empty()
    }
}

/// Run the three checks in order, mutating `tracks` and `mapping` in place.
/// `mount` is the device's mount root (the directory containing
/// `iPod_Control`).
pub fn check_integrity(
    mount: &Path,
    tracks: &mut Vec<TrackInfo>,
    mapping: &mut MappingManager,
    delete_orphans: bool,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    check_db_files_exist(mount, tracks, &mut report);
    check_mapping_dbids(tracks, mapping, &mut report);
    check_orphan_files(mount, tracks, &mut report, delete_orphans);

    if report.is_clean() {
        info!("integrity check passed — all data is consistent");
    } else {
        warn!(
            "integrity issues found: {} missing, {} stale mappings, {} orphans",
            report.missing_file_titles.len(),
            report.stale_mapping_dbids.len(),
            report.orphan_files.len()
        );
    }
    report
}

fn location_to_absolute(mount: &Path, location: &str) -> std::path::PathBuf {
    let relative = location.replace(':', "/");
    let relative = relative.trim_start_matches('/');
    mount.join(relative)
}

fn check_db_files_exist(mount: &Path, tracks: &mut Vec<TrackInfo>, report: &mut IntegrityReport) {
    let before = tracks.len();
    tracks.retain(|track| {
        if track.location.is_empty() {
            return true;
        }
        let exists = location_to_absolute(mount, &track.location).exists();
        if !exists {
            warn!("integrity: file missing for track '{}' — {}", track.title, track.location);
        }
        exists
    });
    if tracks.len() != before {
        report.missing_file_titles.extend(std::iter::repeat("removed".to_string()).take(before - tracks.len()));
        info!("integrity: removed {} tracks with missing files from working set", before - tracks.len());
    }
}

fn check_mapping_dbids(tracks: &[TrackInfo], mapping: &mut MappingManager, report: &mut IntegrityReport) {
    let valid: std::collections::HashSet<u64> = tracks.iter().map(|t| t.dbid).collect();
    let stale: Vec<u64> = mapping.all_dbids().filter(|dbid| !valid.contains(dbid)).collect();
    for dbid in stale {
        mapping.remove_by_dbid(dbid);
        report.stale_mapping_dbids.push(dbid);
        warn!("integrity: removed stale mapping dbid={}", dbid);
    }
}

fn check_orphan_files(
    mount: &Path,
    tracks: &[TrackInfo],
    report: &mut IntegrityReport,
    delete_orphans: bool,
) {
    let music_dir = mount.join("iPod_Control/Music");
    if !music_dir.exists() {
        return;
    }

    let referenced: std::collections::HashSet<std::path::PathBuf> = tracks
        .iter()
        .filter(|t| !t.location.is_empty())
        .map(|t| location_to_absolute(mount, &t.location))
        .collect();

    let mut orphans = Vec::new();
    let Ok(entries) = std::fs::read_dir(&music_dir) else { return };
    for entry in entries.flatten() {
        let folder = entry.path();
        if !folder.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.len() >= 2 && name.starts_with('F') && name[1..].chars().all(|c| c.is_ascii_digit())) {
            continue;
        }
        let Ok(files) = std::fs::read_dir(&folder) else { continue };
        for file_entry in files.flatten() {
            let path = file_entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
            if !AUDIO_EXTS.contains(&ext.as_str()) {
                continue;
            }
            if !referenced.contains(&path) {
                orphans.push(path);
            }
        }
    }

    if !orphans.is_empty() {
        info!("integrity: found {} orphan files", orphans.len());
        if delete_orphans {
            let mut deleted = 0;
            for orphan in &orphans {
                match std::fs::remove_file(orphan) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("integrity: failed to delete orphan {}: {}", orphan.display(), e),
                }
            }
            info!("integrity: deleted {}/{} orphan files", deleted, orphans.len());
        }
    }
    report.orphan_files = orphans;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_to_absolute_converts_colon_path() {
        let mount = Path::new("/mnt/ipod");
        let abs = location_to_absolute(mount, ":iPod_Control:Music:F00:ABCD.mp3");
        assert_eq!(abs, Path::new("/mnt/ipod/iPod_Control/Music/F00/ABCD.mp3"));
    }

    #[test]
    fn missing_file_removes_track_from_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracks = vec![TrackInfo {
            dbid: 1,
            title: "Ghost".into(),
            location: ":iPod_Control:Music:F00:GONE.mp3".into(),
            ..Default::default()
        }];
        let mut report = IntegrityReport::default();
        check_db_files_exist(dir.path(), &mut tracks, &mut report);
        assert!(tracks.is_empty());
        assert_eq!(report.missing_file_titles.len(), 1);
    }
}
