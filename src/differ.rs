//! Fingerprint-based diff engine: scans the PC library, matches against the
//! mapping, and classifies every track into a `SyncPlan`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::warn;
use lofty::prelude::*;
use lofty::tag::ItemKey;
use md5::{Digest, Md5};
use walkdir::WalkDir;

use crate::error::DifferError;
use crate::itunesdb::TrackInfo;
use crate::mapping::{MappingManager, TrackMapping};

const AUDIO_EXTENSIONS: &[&str] =
    &["mp3", "m4a", "m4p", "aac", "flac", "wav", "aif", "aiff", "ogg", "opus", "wma", "alac"];

#[derive(Debug, Clone)]
pub struct PcTrack {
    pub path: PathBuf,
    pub relative_path: String,
    pub extension: String,
    pub mtime: f64,
    pub size: u64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_ms: u32,
    pub rating: Option<u8>,
    pub art_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    AddToIpod,
    RemoveFromIpod,
    UpdateMetadata,
    UpdateFile,
    UpdateArtwork,
    SyncPlayCount,
    SyncRating,
}

#[derive(Debug, Clone, Default)]
pub struct SyncItem {
    pub action: Option<SyncAction>,
    pub fingerprint: String,
    pub pc_track: Option<PcTrack>,
    pub dbid: Option<u64>,
    pub metadata_changes: Vec<(String, String, String)>,
    pub play_count_delta: u32,
    pub skip_count_delta: u32,
    pub ipod_rating: u8,
    pub pc_rating: u8,
    pub new_rating: u8,
    pub old_art_hash: Option<String>,
    pub new_art_hash: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct StorageSummary {
    pub bytes_to_add: u64,
    pub bytes_to_remove: u64,
    pub bytes_to_update: u64,
}

impl StorageSummary {
    pub fn net_change(&self) -> i64 {
        self.bytes_to_add as i64 + self.bytes_to_update as i64 - self.bytes_to_remove as i64
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub to_add: Vec<SyncItem>,
    pub to_remove: Vec<SyncItem>,
    pub to_update_metadata: Vec<SyncItem>,
    pub to_update_file: Vec<SyncItem>,
    pub to_update_artwork: Vec<SyncItem>,
    pub to_sync_playcount: Vec<SyncItem>,
    pub to_sync_rating: Vec<SyncItem>,
    pub storage: StorageSummary,
    pub matched_pc_paths: HashMap<u64, PathBuf>,
    pub artwork_missing_count: u32,
    pub fingerprint_errors: Vec<(PathBuf, String)>,
    pub unresolved_collisions: Vec<(String, Vec<PcTrack>)>,
    pub duplicates: HashMap<String, Vec<PcTrack>>,
    pub stale_mapping_entries: Vec<(String, u64)>,
    pub total_pc_tracks: usize,
    pub total_ipod_tracks: usize,
    pub matched_tracks: usize,
}

impl SyncPlan {
    pub fn has_changes(&self) -> bool {
        !self.to_add.is_empty()
            || !self.to_remove.is_empty()
            || !self.to_update_metadata.is_empty()
            || !self.to_update_file.is_empty()
            || !self.to_update_artwork.is_empty()
            || !self.to_sync_playcount.is_empty()
            || !self.to_sync_rating.is_empty()
            || self.artwork_missing_count > 0
    }
}

/// Walk `root` for audio files and extract lightweight metadata via the
/// tagging library. Errors reading an individual file are logged and
/// skipped, not propagated.
pub fn scan_pc_library(root: &Path) -> Vec<PcTrack> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
        if !AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        match read_pc_track(path, root) {
            Ok(track) => out.push(track),
            Err(e) => warn!("failed to read {}: {}", path.display(), e),
        }
    }
    out
}

fn read_pc_track(path: &Path, root: &Path) -> Result<PcTrack, String> {
    let meta = std::fs::metadata(path).map_err(|e| e.to_string())?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let tagged = lofty::read_from_path(path).map_err(|e| e.to_string())?;
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag());
    let properties = tagged.properties();

    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let title = tag.and_then(|t| t.title()).map(|s| s.to_string()).unwrap_or(stem);
    let artist = tag.and_then(|t| t.artist()).map(|s| s.to_string()).unwrap_or_else(|| "Unknown Artist".into());
    let album = tag.and_then(|t| t.album()).map(|s| s.to_string()).unwrap_or_else(|| "Unknown Album".into());
    let genre = tag.and_then(|t| t.genre()).map(|s| s.to_string());
    let year = tag.and_then(|t| t.year());
    let track_number = tag.and_then(|t| t.track());
    let disc_number = tag.and_then(|t| t.disk());
    let album_artist = tag.and_then(|t| t.get_string(&ItemKey::AlbumArtist)).map(|s| s.to_string());
    let rating_key = ItemKey::from_key(tagged.primary_tag_type(), "RATING");
    let rating = tag.and_then(|t| t.get_string(&rating_key)).and_then(|s| s.parse::<u8>().ok());

    let art_hash = tag.and_then(|t| t.pictures().first()).map(|pic| {
        let mut hasher = Md5::new();
        hasher.update(pic.data());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    });

    let relative_path = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");

    Ok(PcTrack {
        path: path.to_path_buf(),
        relative_path,
        extension: path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase(),
        mtime,
        size: meta.len(),
        title,
        artist,
        album,
        album_artist,
        genre,
        year,
        track_number,
        disc_number,
        duration_ms: properties.duration().as_millis() as u32,
        rating,
        art_hash,
    })
}

/// Disambiguate a fingerprint collision: trivial single-entry case, then a
/// unique `source_path_hint` match. Anything further is surfaced as
/// unresolved — this engine does not fall back to duration/size/tag
/// similarity heuristics.
fn resolve_collision<'a>(pc_track: &PcTrack, entries: &'a [TrackMapping]) -> Option<&'a TrackMapping> {
    if entries.len() == 1 {
        return Some(&entries[0]);
    }
    entries.iter().find(|e| e.source_path_hint.as_deref() == Some(pc_track.relative_path.as_str()))
}

fn source_file_changed(pc_track: &PcTrack, entry: &TrackMapping) -> bool {
    let size_diff = (pc_track.size as i64 - entry.source_size as i64).unsigned_abs();
    let size_pct = size_diff as f64 / entry.source_size.max(1) as f64;
    if size_diff > 10_240 && size_pct > 0.01 {
        return true;
    }
    if pc_track.mtime != entry.source_mtime && size_diff > 0 {
        return true;
    }
    false
}

fn compare_metadata(pc: &PcTrack, ipod: &TrackInfo) -> Vec<(String, String, String)> {
    let mut changes = Vec::new();
    let mut push = |field: &str, pc_val: String, ipod_val: String| {
        if pc_val.trim() != ipod_val.trim() {
            changes.push((field.to_string(), pc_val, ipod_val));
        }
    };
    push("title", pc.title.clone(), ipod.title.clone());
    push("artist", pc.artist.clone(), ipod.artist.clone());
    push("album", pc.album.clone(), ipod.album.clone());
    push("album_artist", pc.album_artist.clone().unwrap_or_default(), ipod.album_artist.clone());
    push("genre", pc.genre.clone().unwrap_or_default(), ipod.genre.clone());
    push("year", pc.year.unwrap_or(0).to_string(), ipod.year.to_string());
    push("track_number", pc.track_number.unwrap_or(0).to_string(), ipod.track_number.to_string());
    push("disc_number", pc.disc_number.unwrap_or(0).to_string(), ipod.disc_number.to_string());
    changes
}

/// Compute the full sync plan. `fingerprint_of` is a closure so callers can
/// plug in the fpcalc-backed collaborator (or a test double) without this
/// module depending directly on subprocess invocation.
pub fn compute_diff(
    pc_root: &Path,
    ipod_tracks: &[TrackInfo],
    mapping: &MappingManager,
    mut fingerprint_of: impl FnMut(&Path) -> Result<String, DifferError>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    let ipod_by_dbid: HashMap<u64, &TrackInfo> = ipod_tracks.iter().map(|t| (t.dbid, t)).collect();
    plan.total_ipod_tracks = ipod_by_dbid.len();

    let pc_tracks = scan_pc_library(pc_root);
    plan.total_pc_tracks = pc_tracks.len();

    let mut pc_by_fp: HashMap<String, Vec<PcTrack>> = HashMap::new();
    let mut seen_fps: HashSet<String> = HashSet::new();

    for track in pc_tracks {
        match fingerprint_of(&track.path) {
            Ok(fp) => {
                seen_fps.insert(fp.clone());
                pc_by_fp.entry(fp).or_default().push(track);
            }
            Err(e) => plan.fingerprint_errors.push((track.path.clone(), e.to_string())),
        }
    }

    let duplicate_fps: HashSet<String> =
        pc_by_fp.iter().filter(|(_, v)| v.len() > 1).map(|(k, _)| k.clone()).collect();
    for fp in &duplicate_fps {
        plan.duplicates.insert(fp.clone(), pc_by_fp[fp].clone());
    }

    for (fp, pc_tracks_for_fp) in pc_by_fp.iter() {
        if duplicate_fps.contains(fp) {
            continue;
        }
        let pc_track = &pc_tracks_for_fp[0];
        let entries = mapping.get_entries(fp);

        if entries.is_empty() {
            plan.to_add.push(SyncItem {
                action: Some(SyncAction::AddToIpod),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                description: format!("New: {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
            plan.storage_mut_add(pc_track.size);
            continue;
        }

        let Some(matched_entry) = resolve_collision(pc_track, entries) else {
            plan.unresolved_collisions.push((fp.clone(), pc_tracks_for_fp.clone()));
            continue;
        };

        let dbid = matched_entry.dbid;
        let Some(ipod_track) = ipod_by_dbid.get(&dbid) else {
            plan.to_add.push(SyncItem {
                action: Some(SyncAction::AddToIpod),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                description: format!("Re-add (stale mapping): {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
            plan.storage_mut_add(pc_track.size);
            continue;
        };

        plan.matched_tracks += 1;
        plan.matched_pc_paths.insert(dbid, pc_track.path.clone());

        if source_file_changed(pc_track, matched_entry) {
            plan.to_update_file.push(SyncItem {
                action: Some(SyncAction::UpdateFile),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                dbid: Some(dbid),
                description: format!("File changed: {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
            plan.storage.bytes_to_update += pc_track.size;
        }

        let changes = compare_metadata(pc_track, ipod_track);
        if !changes.is_empty() {
            plan.to_update_metadata.push(SyncItem {
                action: Some(SyncAction::UpdateMetadata),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                dbid: Some(dbid),
                metadata_changes: changes,
                description: format!("Metadata: {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
        }

        if pc_track.art_hash != matched_entry.art_hash {
            plan.to_update_artwork.push(SyncItem {
                action: Some(SyncAction::UpdateArtwork),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                dbid: Some(dbid),
                old_art_hash: matched_entry.art_hash.clone(),
                new_art_hash: pc_track.art_hash.clone(),
                description: format!("Art changed: {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
        }

        if ipod_track.play_count_since_sync > 0 || ipod_track.skip_count > 0 {
            plan.to_sync_playcount.push(SyncItem {
                action: Some(SyncAction::SyncPlayCount),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                dbid: Some(dbid),
                play_count_delta: ipod_track.play_count_since_sync,
                skip_count_delta: ipod_track.skip_count,
                description: format!("Played {}x: {} - {}", ipod_track.play_count_since_sync, pc_track.artist, pc_track.title),
                ..Default::default()
            });
        }

        let ipod_rating = ipod_track.rating;
        let pc_rating = pc_track.rating.unwrap_or(0);
        if ipod_rating != pc_rating && (ipod_rating > 0 || pc_rating > 0) {
            // Last-write-wins, device side: the user most recently touched
            // the device, so a nonzero device rating always wins.
            let new_rating = if ipod_rating > 0 { ipod_rating } else { pc_rating };
            plan.to_sync_rating.push(SyncItem {
                action: Some(SyncAction::SyncRating),
                fingerprint: fp.clone(),
                pc_track: Some(pc_track.clone()),
                dbid: Some(dbid),
                ipod_rating,
                pc_rating,
                new_rating,
                description: format!("Rating: {} - {}", pc_track.artist, pc_track.title),
                ..Default::default()
            });
        }
    }

    let mapping_fps: HashSet<String> = mapping.fingerprints().map(|s| s.to_string()).collect();
    for fp in mapping_fps.difference(&seen_fps) {
        for entry in mapping.get_entries(fp) {
            match ipod_by_dbid.get(&entry.dbid) {
                None => plan.stale_mapping_entries.push((fp.clone(), entry.dbid)),
                Some(ipod_track) => {
                    plan.to_remove.push(SyncItem {
                        action: Some(SyncAction::RemoveFromIpod),
                        fingerprint: fp.clone(),
                        dbid: Some(entry.dbid),
                        description: format!("Removed from PC: {} - {}", ipod_track.artist, ipod_track.title),
                        ..Default::default()
                    });
                    plan.storage.bytes_to_remove += ipod_track.size_bytes as u64;
                }
            }
        }
    }

    for (dbid, _) in plan.matched_pc_paths.iter() {
        if let Some(ipod_track) = ipod_by_dbid.get(dbid) {
            if !ipod_track.has_artwork || ipod_track.mhii_link == 0 {
                plan.artwork_missing_count += 1;
            }
        }
    }

    plan
}

impl SyncPlan {
    fn storage_mut_add(&mut self, bytes: u64) {
        self.storage.bytes_to_add += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dbid: u64, path_hint: Option<&str>) -> TrackMapping {
        TrackMapping {
            dbid,
            source_format: "mp3".into(),
            ipod_format: "mp3".into(),
            source_size: 1000,
            source_mtime: 1.0,
            last_sync_iso: "2026-01-01T00:00:00Z".into(),
            was_transcoded: false,
            source_path_hint: path_hint.map(|s| s.to_string()),
            art_hash: None,
        }
    }

    fn pc_track(relative_path: &str) -> PcTrack {
        PcTrack {
            path: PathBuf::from(relative_path),
            relative_path: relative_path.to_string(),
            extension: "mp3".into(),
            mtime: 1.0,
            size: 1000,
            title: "T".into(),
            artist: "A".into(),
            album: "Al".into(),
            album_artist: None,
            genre: None,
            year: None,
            track_number: None,
            disc_number: None,
            duration_ms: 1000,
            rating: None,
            art_hash: None,
        }
    }

    #[test]
    fn single_entry_resolves_trivially() {
        let entries = vec![entry(1, None)];
        let pc = pc_track("a.mp3");
        assert_eq!(resolve_collision(&pc, &entries).unwrap().dbid, 1);
    }

    #[test]
    fn multi_entry_resolves_by_path_hint() {
        let entries = vec![entry(1, Some("Greatest Hits/song.mp3")), entry(2, Some("Album/song.mp3"))];
        let pc = pc_track("Album/song.mp3");
        assert_eq!(resolve_collision(&pc, &entries).unwrap().dbid, 2);
    }

    #[test]
    fn multi_entry_with_no_matching_hint_is_unresolved() {
        let entries = vec![entry(1, Some("X/song.mp3")), entry(2, Some("Y/song.mp3"))];
        let pc = pc_track("Z/song.mp3");
        assert!(resolve_collision(&pc, &entries).is_none());
    }

    #[test]
    fn small_size_delta_does_not_trigger_update_file() {
        let e = entry(1, None);
        let mut pc = pc_track("a.mp3");
        pc.size = 1005;
        pc.mtime = 1.0;
        assert!(!source_file_changed(&pc, &e));
    }
}
