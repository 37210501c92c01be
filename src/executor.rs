//! Sync executor: applies a computed `SyncPlan` against the device.
//!
//! Stage order is fixed (pre-flight, checkpoint, remove, update-file,
//! update-metadata, update-artwork-in-mapping, add, artwork rewrite,
//! database write, preferences stamp, commit mapping). A failure in
//! stages 3-9 must never leave the mapping inconsistent with the
//! database — the mapping is only saved after a successful write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use lofty::prelude::*;
use log::{error, info, warn};
use rand::Rng;
use rayon::prelude::*;

use crate::artworkdb::{self, ArtSource, ArtworkJob};
use crate::checkpoint::CheckpointManager;
use crate::checksum::{self, ChecksumKind, ChecksumScheme};
use crate::device::{self, SysInfo};
use crate::differ::{PcTrack, SyncItem, SyncPlan};
use crate::error::{ExecutorError, SyncError};
use crate::fingerprint;
use crate::itunesdb::{self, writer::ReferenceInfo, MediaType, TrackInfo};
use crate::mapping::{MappingManager, TrackMapping};
use crate::prefs;
use crate::transcode::{self, TranscodeCache};

const MUSIC_FOLDER_COUNT: u32 = 50;
const DATABASE_OVERHEAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub stage: &'static str,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub tracks_added: u32,
    pub tracks_removed: u32,
    pub tracks_updated_metadata: u32,
    pub tracks_updated_file: u32,
    pub playcounts_synced: u32,
    pub ratings_synced: u32,
    pub errors: Vec<(String, String)>,
}

impl SyncResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub struct ExecuteOptions {
    pub dry_run: bool,
    pub write_back_to_pc: bool,
    pub aac_bitrate: u32,
    pub max_workers: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            dry_run: false,
            write_back_to_pc: false,
            aac_bitrate: 256,
            max_workers: 0,
        }
    }
}

pub struct SyncExecutor {
    mount: PathBuf,
    music_dir: PathBuf,
    transcode_cache: Mutex<TranscodeCache>,
    checkpoint: CheckpointManager,
    folder_counter: AtomicU32,
}

impl SyncExecutor {
    pub fn new(mount: &Path, cache_root: Option<PathBuf>) -> Result<Self, SyncError> {
        let cache_root = cache_root.unwrap_or_else(TranscodeCache::default_root);
        Ok(SyncExecutor {
            mount: mount.to_path_buf(),
            music_dir: mount.join("iPod_Control/Music"),
            transcode_cache: Mutex::new(TranscodeCache::open(cache_root)?),
            checkpoint: CheckpointManager::new(mount),
            folder_counter: AtomicU32::new(0),
        })
    }

    /// Worker pool sized per `ExecuteOptions::max_workers` (0 = available
    /// parallelism, capped at 8 the way the original sync engine caps its
    /// thread pool).
    fn build_pool(&self, max_workers: usize) -> rayon::ThreadPool {
        let workers = if max_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(8)
        } else {
            max_workers
        };
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .expect("thread pool builds with a bounded, nonzero thread count")
    }

    fn itunesdb_path(&self) -> PathBuf {
        self.mount.join("iPod_Control/iTunes/iTunesDB")
    }

    fn artwork_dir(&self) -> PathBuf {
        self.mount.join("iPod_Control/Artwork")
    }

    /// Determine the checksum scheme to sign the rewritten database with,
    /// preferring key material recovered from the existing database over
    /// inventing new parameters.
    fn resolve_checksum_scheme(&self, sysinfo: &SysInfo, existing_buf: &[u8]) -> ChecksumScheme {
        let kind = device::detect_checksum_kind(&self.mount, sysinfo);
        let guid = sysinfo.firewire_guid.as_deref().and_then(device::parse_firewire_guid);

        match kind {
            ChecksumKind::None => ChecksumScheme::None,
            ChecksumKind::Hash58 => match guid {
                Some(g) => ChecksumScheme::Hash58 { firewire_guid: g },
                None => {
                    warn!("HASH58 device but no FireWire GUID in SysInfo; leaving database unsigned");
                    ChecksumScheme::None
                }
            },
            ChecksumKind::Hash72 | ChecksumKind::Unknown => {
                match checksum::resolve_hash72_iv_nonce(existing_buf) {
                    Some((iv, nonce)) => match guid {
                        Some(g) => ChecksumScheme::Both { firewire_guid: g, iv, nonce },
                        None => ChecksumScheme::Hash72 { iv, nonce },
                    },
                    None => {
                        warn!("HASH72 device but no existing signed database to recover key material from");
                        ChecksumScheme::None
                    }
                }
            }
        }
    }

    /// Execute `plan` against the device. `is_cancelled` is polled between
    /// items and at every stage boundary (refused once stage 8 begins).
    pub fn execute(
        &mut self,
        plan: &SyncPlan,
        mapping: &mut MappingManager,
        opts: &ExecuteOptions,
        is_cancelled: &dyn Fn() -> bool,
    ) -> SyncResult {
        let mut result = SyncResult { success: true, ..Default::default() };

        // ===== Stage 1: pre-flight =====
        if !opts.dry_run && plan.storage.bytes_to_add > 0 {
            let needed = plan
                .storage
                .bytes_to_add
                .saturating_sub(plan.storage.bytes_to_remove)
                .saturating_add(DATABASE_OVERHEAD_BYTES);
            match fs2_free_space(&self.mount) {
                Some(free) if needed > free => {
                    let msg = format!(
                        "not enough space on device: {} MB free, {} MB needed",
                        free / (1024 * 1024),
                        needed / (1024 * 1024)
                    );
                    error!("{msg}");
                    result.errors.push(("storage".into(), msg));
                    result.success = false;
                    return result;
                }
                Some(_) => {}
                None => warn!("could not determine free space on device"),
            }
        }

        // ===== Stage 2: checkpoint =====
        if !opts.dry_run {
            let started_at = started_at_label();
            if !self.checkpoint.create_checkpoint(&started_at) {
                error!("failed to create checkpoint, aborting sync");
                result.errors.push(("checkpoint".into(), "failed to create checkpoint".into()));
                result.success = false;
                return result;
            }
        }

        let existing = itunesdb::parse_itunesdb(&self.itunesdb_path()).unwrap_or_else(|e| {
            warn!("no existing database to read ({e}); starting from an empty track list");
            itunesdb::ParsedDatabase { reference: ReferenceInfo::default(), tracks: Vec::new() }
        });
        let mut tracks_by_dbid: HashMap<u64, TrackInfo> =
            existing.tracks.into_iter().map(|t| (t.dbid, t)).collect();

        let existing_buf = std::fs::read(self.itunesdb_path()).unwrap_or_default();
        let sysinfo = device::read_sysinfo(&self.mount).unwrap_or_default();
        let scheme = self.resolve_checksum_scheme(&sysinfo, &existing_buf);

        let mut pc_file_paths: HashMap<u64, PathBuf> = plan.matched_pc_paths.clone();
        let mut new_tracks: Vec<TrackInfo> = Vec::new();
        let mut new_track_sources: Vec<(usize, PcTrack, bool, String)> = Vec::new();

        macro_rules! bail_if_cancelled {
            () => {
                if is_cancelled() {
                    warn!("sync cancelled by user");
                    result.errors.push(("cancelled".into(), "sync was cancelled by user".into()));
                    result.success = false;
                    return result;
                }
            };
        }

        // ===== Stage 3: remove =====
        bail_if_cancelled!();
        self.execute_removes(plan, mapping, &mut tracks_by_dbid, opts.dry_run, &mut result);

        // ===== Stage 4: update file =====
        bail_if_cancelled!();
        self.execute_file_updates(plan, mapping, &mut tracks_by_dbid, &mut pc_file_paths, opts, is_cancelled, &mut result);

        // ===== Stage 5: update metadata =====
        bail_if_cancelled!();
        self.execute_metadata_updates(plan, mapping, &mut tracks_by_dbid, opts.dry_run, &mut result);

        // ===== Stage 6: update artwork in mapping =====
        self.execute_artwork_mapping_updates(plan, mapping, opts.dry_run);

        // ===== Stage 7: add =====
        bail_if_cancelled!();
        self.execute_adds(plan, &mut new_tracks, &mut new_track_sources, &mut pc_file_paths, opts, is_cancelled, &mut result);

        // ===== Stage 5b/6b: play count and rating sync =====
        self.execute_playcount_sync(plan, &mut tracks_by_dbid, opts, &mut result);
        self.execute_rating_sync(plan, &mut tracks_by_dbid, opts, &mut result);

        if opts.dry_run {
            result.success = !result.has_errors();
            return result;
        }

        let mut all_tracks: Vec<TrackInfo> = tracks_by_dbid.into_values().collect();
        all_tracks.extend(new_tracks);

        // New tracks still carry dbid == 0. Assign their final id now, using
        // the same placeholder formula `write_mhbd` uses for untouched
        // dbid == 0 tracks, so artwork links (keyed by dbid) match what the
        // database write below will keep unchanged.
        for (idx, track) in all_tracks.iter_mut().enumerate() {
            if track.dbid == 0 {
                track.dbid = 0x1_0000_0000 + idx as u64;
            }
        }
        let new_tail_start = all_tracks.len() - new_track_sources.len();
        for ((_, pc_track, _, _), track) in new_track_sources.iter().zip(&all_tracks[new_tail_start..]) {
            pc_file_paths.insert(track.dbid, pc_track.path.clone());
        }

        // ===== Stage 8: artwork rewrite =====
        let jobs: Vec<ArtworkJob> = build_artwork_jobs(&all_tracks, &pc_file_paths);
        let links = if jobs.is_empty() {
            HashMap::new()
        } else {
            match artworkdb::write_artworkdb(&self.artwork_dir(), &jobs) {
                Ok(links) => links,
                Err(e) => {
                    error!("artwork database write failed: {e}");
                    result.errors.push(("artwork".into(), e.to_string()));
                    result.success = false;
                    return result;
                }
            }
        };
        for track in all_tracks.iter_mut() {
            if let Some(link) = links.get(&track.dbid) {
                track.mhii_link = link.img_id as u64;
                track.artwork_size = link.src_img_size;
                track.has_artwork = true;
                track.artwork_size = link.src_img_size;
            }
        }

        // ===== Stage 9: database write =====
        let reference = ReferenceInfo { hashing_scheme: existing.reference.hashing_scheme, ..existing.reference };
        match itunesdb::write_itunesdb(&self.itunesdb_path(), &mut all_tracks, &reference, scheme) {
            Ok(()) => {
                info!("database written with {} tracks", all_tracks.len());
            }
            Err(e) => {
                error!("database write failed, mapping not saved: {e}");
                result.errors.push(("database write".into(), e.to_string()));
                result.success = false;
                return result;
            }
        }

        // Backpatch mapping entries for new tracks now that real dbids exist.
        // `all_tracks` has `new_track_sources` appended, in the same push
        // order, as its tail slice.
        let tail_start = all_tracks.len() - new_track_sources.len();
        let dbid_by_index: HashMap<usize, u64> = new_track_sources
            .iter()
            .zip(&all_tracks[tail_start..])
            .map(|((orig_idx, _, _, _), track)| (*orig_idx, track.dbid))
            .collect();
        for (orig_idx, pc_track, was_transcoded, fingerprint) in &new_track_sources {
            let Some(dbid) = dbid_by_index.get(orig_idx) else { continue };
            mapping.add(
                fingerprint,
                TrackMapping {
                    dbid: *dbid,
                    source_format: extension_of(&pc_track.path),
                    ipod_format: extension_of(&pc_track.path),
                    source_size: pc_track.size,
                    source_mtime: pc_track.mtime,
                    last_sync_iso: now_iso(),
                    was_transcoded: *was_transcoded,
                    source_path_hint: Some(pc_track.relative_path.clone()),
                    art_hash: pc_track.art_hash.clone(),
                },
            );
        }

        // ===== Stage 11: commit mapping (only after a successful write) =====
        if let Err(e) = mapping.save() {
            error!("failed to persist mapping after successful database write: {e}");
            result.errors.push(("mapping save".into(), e.to_string()));
            result.success = false;
            return result;
        }

        // ===== Stage 10: preferences stamp =====
        let total_bytes: u64 = all_tracks.iter().map(|t| t.size_bytes as u64).sum();
        let total_secs: u64 = all_tracks.iter().map(|t| t.duration_ms as u64).sum::<u64>() / 1000;
        prefs::protect_from_itunes(&self.mount, all_tracks.len() as u32, total_bytes, total_secs);

        self.checkpoint.mark_complete();
        result.success = !result.has_errors();
        result
    }

    fn execute_removes(
        &self,
        plan: &SyncPlan,
        mapping: &mut MappingManager,
        tracks: &mut HashMap<u64, TrackInfo>,
        dry_run: bool,
        result: &mut SyncResult,
    ) {
        for item in &plan.to_remove {
            if dry_run {
                result.tracks_removed += 1;
                continue;
            }
            if let Some(dbid) = item.dbid {
                if let Some(track) = tracks.remove(&dbid) {
                    let full_path = location_to_absolute(&self.mount, &track.location);
                    if let Err(e) = std::fs::remove_file(&full_path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("failed to delete {}: {e}", full_path.display());
                        }
                    }
                }
                if !item.fingerprint.is_empty() {
                    mapping.remove(&item.fingerprint, dbid);
                } else {
                    mapping.remove_by_dbid(dbid);
                }
            }
            result.tracks_removed += 1;
        }
        for (fp, dbid) in &plan.stale_mapping_entries {
            mapping.remove(fp, *dbid);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_file_updates(
        &self,
        plan: &SyncPlan,
        mapping: &mut MappingManager,
        tracks: &mut HashMap<u64, TrackInfo>,
        pc_file_paths: &mut HashMap<u64, PathBuf>,
        opts: &ExecuteOptions,
        is_cancelled: &dyn Fn() -> bool,
        result: &mut SyncResult,
    ) {
        if opts.dry_run {
            result.tracks_updated_file += plan.to_update_file.len() as u32;
            return;
        }

        for item in &plan.to_update_file {
            let Some(dbid) = item.dbid else { continue };
            if let Some(existing) = tracks.get(&dbid) {
                let full_path = location_to_absolute(&self.mount, &existing.location);
                let _ = std::fs::remove_file(&full_path);
            }
            if !item.fingerprint.is_empty() {
                self.transcode_cache.lock().unwrap().invalidate(&item.fingerprint, None);
            }
        }

        // Copy/transcode is the expensive part; run it on a scoped pool and
        // apply the results to shared state sequentially afterward.
        let pool = self.build_pool(opts.max_workers);
        let copies: Vec<(&SyncItem, Result<(PathBuf, bool), ExecutorError>)> = pool.install(|| {
            plan.to_update_file
                .par_iter()
                .map(|item| {
                    if is_cancelled() {
                        return (item, Err(ExecutorError::Cancelled));
                    }
                    let outcome = match &item.pc_track {
                        Some(pc_track) => self.copy_to_device(pc_track, &item.fingerprint, opts.aac_bitrate),
                        None => Err(ExecutorError::SourceFileMissing(PathBuf::new())),
                    };
                    (item, outcome)
                })
                .collect()
        });

        for (item, outcome) in copies {
            let Some(dbid) = item.dbid else { continue };
            let Some(pc_track) = &item.pc_track else { continue };
            match outcome {
                Ok((dest, was_transcoded)) => {
                    if let Some(track) = tracks.get_mut(&dbid) {
                        track.location = absolute_to_location(&self.mount, &dest);
                        track.size_bytes = std::fs::metadata(&dest).map(|m| m.len() as u32).unwrap_or(track.size_bytes);
                        track.duration_ms = pc_track.duration_ms;
                    }
                    pc_file_paths.insert(dbid, pc_track.path.clone());
                    mapping.add(
                        &item.fingerprint,
                        TrackMapping {
                            dbid,
                            source_format: extension_of(&pc_track.path),
                            ipod_format: extension_of(&dest),
                            source_size: pc_track.size,
                            source_mtime: pc_track.mtime,
                            last_sync_iso: now_iso(),
                            was_transcoded,
                            source_path_hint: Some(pc_track.relative_path.clone()),
                            art_hash: pc_track.art_hash.clone(),
                        },
                    );
                    result.tracks_updated_file += 1;
                }
                Err(e) => {
                    warn!("{}: {e}", item.description);
                    result.errors.push((item.description.clone(), e.to_string()));
                }
            }
        }
    }

    fn execute_metadata_updates(
        &self,
        plan: &SyncPlan,
        mapping: &mut MappingManager,
        tracks: &mut HashMap<u64, TrackInfo>,
        dry_run: bool,
        result: &mut SyncResult,
    ) {
        for item in &plan.to_update_metadata {
            if dry_run {
                result.tracks_updated_metadata += 1;
                continue;
            }
            let Some(dbid) = item.dbid else { continue };
            if let Some(track) = tracks.get_mut(&dbid) {
                apply_metadata_changes(track, &item.metadata_changes);
            }
            if let Some(pc_track) = &item.pc_track {
                refresh_mapping_freshness(mapping, &item.fingerprint, dbid, pc_track);
            }
            result.tracks_updated_metadata += 1;
        }
    }

    fn execute_artwork_mapping_updates(&self, plan: &SyncPlan, mapping: &mut MappingManager, dry_run: bool) {
        if dry_run {
            return;
        }
        for item in &plan.to_update_artwork {
            let Some(dbid) = item.dbid else { continue };
            let entries = mapping.get_entries(&item.fingerprint);
            if let Some(existing) = entries.iter().find(|e| e.dbid == dbid).cloned() {
                mapping.remove(&item.fingerprint, dbid);
                mapping.add(&item.fingerprint, TrackMapping { art_hash: item.new_art_hash.clone(), ..existing });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_adds(
        &self,
        plan: &SyncPlan,
        new_tracks: &mut Vec<TrackInfo>,
        new_track_sources: &mut Vec<(usize, PcTrack, bool, String)>,
        pc_file_paths: &mut HashMap<u64, PathBuf>,
        opts: &ExecuteOptions,
        is_cancelled: &dyn Fn() -> bool,
        result: &mut SyncResult,
    ) {
        if opts.dry_run {
            result.tracks_added += plan.to_add.iter().filter(|item| item.pc_track.is_some()).count() as u32;
            return;
        }

        let pool = self.build_pool(opts.max_workers);
        let copies: Vec<(usize, &SyncItem, Result<(PathBuf, bool), ExecutorError>)> = pool.install(|| {
            plan.to_add
                .par_iter()
                .enumerate()
                .map(|(idx, item)| {
                    if is_cancelled() {
                        return (idx, item, Err(ExecutorError::Cancelled));
                    }
                    let outcome = match &item.pc_track {
                        Some(pc_track) => self.copy_to_device(pc_track, &item.fingerprint, opts.aac_bitrate),
                        None => Err(ExecutorError::SourceFileMissing(PathBuf::new())),
                    };
                    (idx, item, outcome)
                })
                .collect()
        });

        for (idx, item, outcome) in copies {
            let Some(pc_track) = &item.pc_track else { continue };
            match outcome {
                Ok((dest, was_transcoded)) => {
                    let location = absolute_to_location(&self.mount, &dest);
                    let mut track_info = pc_track_to_info(pc_track, &location, was_transcoded, opts.aac_bitrate);
                    track_info.size_bytes = std::fs::metadata(&dest).map(|m| m.len() as u32).unwrap_or(track_info.size_bytes);
                    new_tracks.push(track_info);

                    let fingerprint = if item.fingerprint.is_empty() {
                        fingerprint::is_fpcalc_available()
                            .then(|| fingerprint::find_fpcalc())
                            .flatten()
                            .and_then(|tool| fingerprint::get_or_compute_fingerprint(&pc_track.path, &tool, true).ok())
                            .unwrap_or_default()
                    } else {
                        item.fingerprint.clone()
                    };
                    new_track_sources.push((idx, pc_track.clone(), was_transcoded, fingerprint));
                    result.tracks_added += 1;
                }
                Err(e) => {
                    warn!("{}: {e}", item.description);
                    result.errors.push((item.description.clone(), e.to_string()));
                }
            }
        }
    }

    fn execute_playcount_sync(
        &self,
        plan: &SyncPlan,
        tracks: &mut HashMap<u64, TrackInfo>,
        opts: &ExecuteOptions,
        result: &mut SyncResult,
    ) {
        for item in &plan.to_sync_playcount {
            if !opts.dry_run {
                if let (Some(dbid), Some(track)) = (item.dbid, item.dbid.and_then(|d| tracks.get_mut(&d))) {
                    track.play_count += item.play_count_delta;
                    track.play_count_since_sync = 0;
                    track.skip_count = track.skip_count.saturating_sub(item.skip_count_delta);
                    let _ = dbid;
                }
                if opts.write_back_to_pc {
                    if let Some(pc_track) = &item.pc_track {
                        if item.play_count_delta > 0 {
                            let _ = write_playcount_to_pc(&pc_track.path, item.play_count_delta);
                        }
                    }
                }
            }
            result.playcounts_synced += 1;
        }
    }

    fn execute_rating_sync(
        &self,
        plan: &SyncPlan,
        tracks: &mut HashMap<u64, TrackInfo>,
        opts: &ExecuteOptions,
        result: &mut SyncResult,
    ) {
        for item in &plan.to_sync_rating {
            if !opts.dry_run {
                if let Some(dbid) = item.dbid {
                    if let Some(track) = tracks.get_mut(&dbid) {
                        track.rating = item.new_rating;
                    }
                }
                if opts.write_back_to_pc {
                    if let Some(pc_track) = &item.pc_track {
                        let _ = write_rating_to_pc(&pc_track.path, item.new_rating);
                    }
                }
            }
            result.ratings_synced += 1;
        }
    }

    fn next_music_folder(&self) -> PathBuf {
        let n = self.folder_counter.fetch_add(1, Ordering::SeqCst) % MUSIC_FOLDER_COUNT;
        let folder = self.music_dir.join(format!("F{:02}", n));
        let _ = std::fs::create_dir_all(&folder);
        folder
    }

    fn generate_device_filename(dest_folder: &Path, ext: &str) -> String {
        const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let name: String = (0..4).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect();
            let filename = format!("{name}.{ext}");
            if !dest_folder.join(&filename).exists() {
                return filename;
            }
        }
        format!("{:08X}.{ext}", rng.gen::<u32>())
    }

    /// Copy or transcode `pc_track` onto the device, consulting the
    /// transcode cache first. Returns the destination path and whether a
    /// transcode occurred.
    fn copy_to_device(&self, pc_track: &PcTrack, fingerprint: &str, aac_bitrate: u32) -> Result<(PathBuf, bool), ExecutorError> {
        let dest_folder = self.next_music_folder();
        let target = transcode::target_for_extension(&pc_track.extension);
        let target_format = match target {
            transcode::TranscodeTarget::Alac => "m4a",
            transcode::TranscodeTarget::Aac => "m4a",
            transcode::TranscodeTarget::Copy => pc_track.extension.as_str(),
        };
        let bitrate = matches!(target, transcode::TranscodeTarget::Aac).then_some(aac_bitrate);

        if target != transcode::TranscodeTarget::Copy && !fingerprint.is_empty() {
            let cached = self.transcode_cache.lock().unwrap().get(fingerprint, target_format, bitrate, pc_track.size);
            if let Some(cached) = cached {
                let filename = Self::generate_device_filename(&dest_folder, target_format);
                let dest = dest_folder.join(&filename);
                std::fs::copy(&cached, &dest).map_err(|e| ExecutorError::TranscodeFailed {
                    path: pc_track.path.clone(),
                    reason: e.to_string(),
                })?;
                return Ok((dest, true));
            }
        }

        let stem = Self::generate_device_filename(&dest_folder, "tmp");
        let stem = stem.trim_end_matches(".tmp");
        let out = transcode::transcode(&pc_track.path, &dest_folder, stem, None, aac_bitrate)?;

        if out.was_transcoded && !fingerprint.is_empty() {
            let added = self.transcode_cache.lock().unwrap().add(
                fingerprint,
                target_format,
                bitrate,
                &pc_track.extension,
                pc_track.size,
                &out.output_path,
                now_unix(),
            );
            if let Err(e) = added {
                warn!("failed to populate transcode cache: {e}");
            }
        }

        Ok((out.output_path, out.was_transcoded))
    }
}

fn build_artwork_jobs(tracks: &[TrackInfo], pc_file_paths: &HashMap<u64, PathBuf>) -> Vec<ArtworkJob> {
    let mut jobs = Vec::new();
    for track in tracks {
        let Some(source_path) = pc_file_paths.get(&track.dbid) else { continue };
        let Ok(bytes) = std::fs::read(source_path) else { continue };
        let Ok(tagged) = lofty::read_from_path(source_path) else { continue };
        let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) else { continue };
        let Some(picture) = tag.pictures().first() else { continue };
        let _ = bytes;
        let content_hash: [u8; 16] = {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(picture.data());
            hasher.finalize().into()
        };
        jobs.push(ArtworkJob { track_dbid: track.dbid, content_hash, source: ArtSource::Fresh(picture.data().to_vec()) });
    }
    jobs
}

fn apply_metadata_changes(track: &mut TrackInfo, changes: &[(String, String, String)]) {
    for (field, pc_value, _ipod_value) in changes {
        match field.as_str() {
            "title" => track.title = pc_value.clone(),
            "artist" => track.artist = pc_value.clone(),
            "album" => track.album = pc_value.clone(),
            "album_artist" => track.album_artist = pc_value.clone(),
            "genre" => track.genre = pc_value.clone(),
            "year" => track.year = pc_value.parse().unwrap_or(0),
            "track_number" => track.track_number = pc_value.parse().unwrap_or(0),
            "disc_number" => track.disc_number = pc_value.parse().unwrap_or(0),
            _ => {}
        }
    }
}

fn refresh_mapping_freshness(mapping: &mut MappingManager, fingerprint: &str, dbid: u64, pc_track: &PcTrack) {
    let Some(existing) = mapping.get_entries(fingerprint).iter().find(|e| e.dbid == dbid).cloned() else { return };
    mapping.remove(fingerprint, dbid);
    mapping.add(
        fingerprint,
        TrackMapping {
            source_size: pc_track.size,
            source_mtime: pc_track.mtime,
            last_sync_iso: now_iso(),
            ..existing
        },
    );
}

fn pc_track_to_info(pc_track: &PcTrack, location: &str, was_transcoded: bool, aac_bitrate: u32) -> TrackInfo {
    let ext = location.rsplit(':').next().and_then(|s| s.rsplit('.').next()).unwrap_or("").to_ascii_lowercase();
    let media_type = MediaType::Audio;
    TrackInfo {
        title: pc_track.title.clone(),
        artist: pc_track.artist.clone(),
        album: pc_track.album.clone(),
        album_artist: pc_track.album_artist.clone().unwrap_or_default(),
        genre: pc_track.genre.clone().unwrap_or_default(),
        year: pc_track.year.unwrap_or(0),
        track_number: pc_track.track_number.unwrap_or(0),
        disc_number: pc_track.disc_number.unwrap_or(1),
        total_discs: 1,
        duration_ms: pc_track.duration_ms,
        size_bytes: pc_track.size as u32,
        bitrate: if was_transcoded && ext == "m4a" { aac_bitrate } else { 0 },
        sample_rate: 44100,
        rating: pc_track.rating.unwrap_or(0),
        media_type,
        location: location.to_string(),
        vbr: false,
        ..Default::default()
    }
}

fn location_to_absolute(mount: &Path, location: &str) -> PathBuf {
    mount.join(location.trim_start_matches(':').replace(':', "/"))
}

fn absolute_to_location(mount: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(mount).unwrap_or(path);
    format!(":{}", rel.to_string_lossy().replace('/', ":").replace('\\', ":"))
}

fn extension_of(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase()
}

fn write_playcount_to_pc(path: &Path, delta: u32) -> Result<(), ()> {
    let mut tagged = lofty::read_from_path(path).map_err(|_| ())?;
    let tag_type = tagged.primary_tag_type();
    if tagged.primary_tag().is_none() {
        tagged.insert_tag(lofty::tag::Tag::new(tag_type));
    }
    let tag = tagged.primary_tag_mut().ok_or(())?;
    let key = lofty::tag::ItemKey::from_key(tag_type, "PLAY_COUNT");
    let existing: u32 = tag.get_string(&key).and_then(|s| s.parse().ok()).unwrap_or(0);
    tag.insert_text(key, (existing + delta).to_string());
    tagged.save_to_path(path, lofty::config::WriteOptions::default()).map_err(|_| ())
}

fn write_rating_to_pc(path: &Path, rating: u8) -> Result<(), ()> {
    let mut tagged = lofty::read_from_path(path).map_err(|_| ())?;
    let tag_type = tagged.primary_tag_type();
    if tagged.primary_tag().is_none() {
        tagged.insert_tag(lofty::tag::Tag::new(tag_type));
    }
    let tag = tagged.primary_tag_mut().ok_or(())?;
    let key = lofty::tag::ItemKey::from_key(tag_type, "RATING");
    tag.insert_text(key, rating.to_string());
    tagged.save_to_path(path, lofty::config::WriteOptions::default()).map_err(|_| ())
}

fn fs2_free_space(mount: &Path) -> Option<u64> {
    fs2::available_space(mount).ok()
}

fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn started_at_label() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Shared cancellation flag the CLI's Ctrl-C handler sets; polled by the
/// executor between items and at stage boundaries.
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_round_trips_through_absolute_path() {
        let mount = Path::new("/mnt/ipod");
        let abs = location_to_absolute(mount, ":iPod_Control:Music:F12:ABCD.mp3");
        assert_eq!(abs, PathBuf::from("/mnt/ipod/iPod_Control/Music/F12/ABCD.mp3"));
        assert_eq!(absolute_to_location(mount, &abs), ":iPod_Control:Music:F12:ABCD.mp3");
    }

    #[test]
    fn cancel_flag_starts_clear() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.request();
        assert!(flag.is_set());
    }
}
