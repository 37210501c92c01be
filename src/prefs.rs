//! Device preferences writer: the binary `iTunesPrefs` ("frpd") record and
//! its `iTunesPrefs.plist` XML wrapper.

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 4] = b"frpd";
const DEFAULT_SIZE: usize = 1232;

const OFF_SETUP_DONE: usize = 8;
const OFF_AUTO_OPEN: usize = 9;
const OFF_SYNC_MODE: usize = 10;
const OFF_SYNC_TYPE: usize = 11;
const OFF_LIBRARY_ID: usize = 12;
const OFF_ENABLE_DISK: usize = 31;
const OFF_CHECKED_ONLY: usize = 34;
const HISTORY_START: usize = 384;
const HISTORY_BLOCK: usize = 128;

#[derive(Debug, Clone, Default)]
pub struct DeviceTotals {
    pub total_disk_bytes: u64,
    pub free_disk_bytes: u64,
    pub other_disk_bytes: u64,
    pub total_music_tracks: u32,
    pub total_music_bytes: u64,
    pub total_music_seconds: u64,
    pub total_audio_tracks: u32,
    pub total_audio_bytes: u64,
    pub total_audio_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SyncHistoryEntry {
    pub username: String,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct ITunesPrefs {
    pub setup_done: bool,
    pub auto_open: bool,
    pub sync_mode_auto: bool,
    pub sync_entire_library: bool,
    pub library_link_id: [u8; 8],
    pub enable_disk_use: bool,
    pub checked_only: bool,
    pub sync_history: Vec<SyncHistoryEntry>,
    pub device_totals: Option<DeviceTotals>,
    raw_binary: Vec<u8>,
}

impl Default for ITunesPrefs {
    fn default() -> Self {
        ITunesPrefs {
            setup_done: false,
            auto_open: false,
            sync_mode_auto: true,
            sync_entire_library: true,
            library_link_id: [0; 8],
            enable_disk_use: false,
            checked_only: false,
            sync_history: Vec::new(),
            device_totals: None,
            raw_binary: Vec::new(),
        }
    }
}

fn read_padded_string(data: &[u8], offset: usize, length: usize) -> String {
    let raw = &data[offset..offset + length];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(length);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn write_padded_string(buf: &mut [u8], offset: usize, value: &str, length: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(length - 1);
    buf[offset..offset + length].fill(0);
    buf[offset..offset + take].copy_from_slice(&bytes[..take]);
}

fn parse_binary(data: &[u8]) -> ITunesPrefs {
    let mut prefs = ITunesPrefs { raw_binary: data.to_vec(), ..Default::default() };
    if data.len() < 32 || &data[0..4] != MAGIC {
        warn!("iTunesPrefs: invalid magic or too short ({} bytes)", data.len());
        return prefs;
    }

    prefs.setup_done = data[OFF_SETUP_DONE] == 0x01;
    prefs.auto_open = data[OFF_AUTO_OPEN] == 0x01;
    prefs.sync_mode_auto = data[OFF_SYNC_MODE] == 0x01;
    prefs.sync_entire_library = data[OFF_SYNC_TYPE] == 0x01;
    prefs.library_link_id.copy_from_slice(&data[OFF_LIBRARY_ID..OFF_LIBRARY_ID + 8]);
    if data.len() > OFF_ENABLE_DISK {
        prefs.enable_disk_use = data[OFF_ENABLE_DISK] == 0x01;
    }
    if data.len() > OFF_CHECKED_ONLY {
        prefs.checked_only = data[OFF_CHECKED_ONLY] == 0x01;
    }

    let mut offset = HISTORY_START;
    while offset + HISTORY_BLOCK <= data.len() {
        let username = read_padded_string(data, offset, 64);
        let hostname = read_padded_string(data, offset + 64, 64);
        if !username.is_empty() || !hostname.is_empty() {
            prefs.sync_history.push(SyncHistoryEntry { username, hostname });
        }
        offset += HISTORY_BLOCK;
    }

    prefs
}

/// Deterministic 8-byte library-link ID tying this sync tool's identity on
/// this host to a stable value across syncs.
pub fn generate_library_id() -> [u8; 8] {
    let hostname = hostname_string();
    let identity = format!("ipod-classic-sync:{}", hostname);
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn hostname_string() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn itunes_dir(mount: &Path) -> PathBuf {
    mount.join("iPod_Control/iTunes")
}

pub fn read_prefs(mount: &Path) -> ITunesPrefs {
    let binary_path = itunes_dir(mount).join("iTunesPrefs");
    let plist_path = itunes_dir(mount).join("iTunesPrefs.plist");

    let mut prefs = match std::fs::read(&binary_path) {
        Ok(data) => parse_binary(&data),
        Err(_) => ITunesPrefs::default(),
    };

    if let Ok(value) = plist::Value::from_file(&plist_path) {
        if let Some(dict) = value.as_dictionary() {
            prefs.device_totals = parse_plist_totals(dict);
        }
    }

    prefs
}

fn parse_plist_totals(dict: &plist::Dictionary) -> Option<DeviceTotals> {
    let edt = dict.get("EstimatedDeviceTotals")?.as_dictionary()?;
    let u = |key: &str| edt.get(key).and_then(|v| v.as_unsigned_integer()).unwrap_or(0);
    Some(DeviceTotals {
        total_disk_bytes: u("totalDiskBytes"),
        free_disk_bytes: u("freeDiskBytes"),
        other_disk_bytes: u("otherDiskBytes"),
        total_music_tracks: u("totalMusicTracks") as u32,
        total_music_bytes: u("totalMusicBytes"),
        total_music_seconds: u("totalMusicSeconds"),
        total_audio_tracks: u("totalAudioTracks") as u32,
        total_audio_bytes: u("totalAudioBytes"),
        total_audio_seconds: u("totalAudioSeconds"),
    })
}

/// Returns `None` if the library-link ID is unset (fresh device) or
/// matches ours; `Some(message)` if a foreign library synced since.
pub fn check_library_owner(prefs: &ITunesPrefs) -> Option<String> {
    let our_id = generate_library_id();
    if prefs.library_link_id == [0u8; 8] || prefs.library_link_id == our_id {
        return None;
    }
    Some(format!(
        "iPod was last synced by a different program/library (library ID: {}). The database may have been modified externally.",
        hex_encode(&prefs.library_link_id)
    ))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

const STANDARD_EMPTY_KEYS: &[&str] = &[
    "AudiobookPlaylistIDs",
    "AudiobookTrackIDs",
    "MoviePlaylistIDs",
    "MovieTrackIDs",
    "MusicAlbumIDs",
    "MusicArtistIDs",
    "MusicGenreNames",
    "MusicPlaylistIDs",
    "MusicTrackIDs",
    "PodcastChannelIDs",
    "PodcastPlaylistIDs",
    "PodcastTrackIDs",
    "TVShowAlbumIDs",
    "TVShowNames",
    "TVShowPlaylistIDs",
    "TVShowTrackIDs",
];

/// Force manual sync + no auto-open, stamp the library-link ID, refresh
/// `EstimatedDeviceTotals`, and write both files atomically. Call this
/// only after the iTunesDB rewrite has succeeded.
pub fn protect_from_itunes(
    mount: &Path,
    track_count: u32,
    total_music_bytes: u64,
    total_music_seconds: u64,
) -> ITunesPrefs {
    let dir = itunes_dir(mount);
    let binary_path = dir.join("iTunesPrefs");
    let plist_path = dir.join("iTunesPrefs.plist");

    let mut prefs = read_prefs(mount);
    let mut buf = if prefs.raw_binary.len() >= 32 {
        std::mem::take(&mut prefs.raw_binary)
    } else {
        let mut fresh = vec![0u8; DEFAULT_SIZE];
        fresh[0..4].copy_from_slice(MAGIC);
        fresh
    };

    buf[OFF_SYNC_MODE] = 0x00;
    prefs.sync_mode_auto = false;
    buf[OFF_AUTO_OPEN] = 0x00;
    prefs.auto_open = false;

    let our_id = generate_library_id();
    buf[OFF_LIBRARY_ID..OFF_LIBRARY_ID + 8].copy_from_slice(&our_id);
    prefs.library_link_id = our_id;

    buf[OFF_SETUP_DONE] = 0x01;
    prefs.setup_done = true;
    buf[OFF_ENABLE_DISK] = 0x01;
    prefs.enable_disk_use = true;

    if let Err(e) = std::fs::create_dir_all(&dir) {
        error!("failed to create iTunes directory: {}", e);
    }
    let tmp = binary_path.with_extension("tmp");
    match std::fs::write(&tmp, &buf).and_then(|_| std::fs::rename(&tmp, &binary_path)) {
        Ok(()) => info!("iTunesPrefs: wrote protective settings (manual sync, no auto-open, library_id={})", hex_encode(&our_id)),
        Err(e) => error!("failed to write iTunesPrefs: {}", e),
    }

    let mut dict = plist::Dictionary::new();
    dict.insert("iPodPrefs".to_string(), plist::Value::Data(buf.clone()));
    dict.insert(
        "EstimatedDeviceTotals".to_string(),
        build_device_totals(mount, track_count, total_music_bytes, total_music_seconds),
    );
    for key in STANDARD_EMPTY_KEYS {
        dict.insert(key.to_string(), plist::Value::Array(Vec::new()));
    }

    let value = plist::Value::Dictionary(dict);
    let tmp_plist = plist_path.with_extension("plist.tmp");
    let written = match value.to_file_xml(&tmp_plist) {
        Ok(()) => std::fs::rename(&tmp_plist, &plist_path).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match written {
        Ok(()) => info!("iTunesPrefs.plist: updated with {} tracks, device totals refreshed", track_count),
        Err(e) => error!("failed to write iTunesPrefs.plist: {}", e),
    }

    prefs.raw_binary = buf;
    prefs
}

fn build_device_totals(mount: &Path, track_count: u32, total_music_bytes: u64, total_music_seconds: u64) -> plist::Value {
    let (total_bytes, free_bytes) = disk_usage(mount);
    let other_bytes = total_bytes.saturating_sub(free_bytes).saturating_sub(total_music_bytes);

    let mut dict = plist::Dictionary::new();
    let mut put = |key: &str, val: i64| {
        dict.insert(key.to_string(), plist::Value::Integer(val.into()));
    };
    put("freeDiskBytes", free_bytes as i64);
    put("otherDiskBytes", other_bytes as i64);
    put("reservedDiskBytes", 0);
    put("totalDiskBytes", total_bytes as i64);
    put("totalAudioBytes", total_music_bytes as i64);
    put("totalAudioSeconds", total_music_seconds as i64);
    put("totalAudioTracks", track_count as i64);
    put("totalMusicBytes", total_music_bytes as i64);
    put("totalMusicSeconds", total_music_seconds as i64);
    put("totalMusicTracks", track_count as i64);
    put("totalVideoBytes", 0);
    put("totalVideoTracks", 0);
    put("totalPodcastBytes", 0);
    put("totalPodcastTracks", 0);
    put("totalPhotoBytes", 0);
    put("totalPhotos", 0);

    dict.insert("supportsAudio".to_string(), plist::Value::Boolean(true));
    dict.insert("supportsVideos".to_string(), plist::Value::Boolean(true));
    dict.insert("supportsPhotos".to_string(), plist::Value::Boolean(true));
    dict.insert("supportsGames".to_string(), plist::Value::Boolean(true));

    plist::Value::Dictionary(dict)
}

fn disk_usage(mount: &Path) -> (u64, u64) {
    let total = fs2::total_space(mount).unwrap_or(0);
    let free = fs2::free_space(mount).unwrap_or(0);
    (total, free)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_library_id_is_deterministic() {
        assert_eq!(generate_library_id(), generate_library_id());
    }

    #[test]
    fn check_library_owner_accepts_fresh_device() {
        let prefs = ITunesPrefs::default();
        assert!(check_library_owner(&prefs).is_none());
    }

    #[test]
    fn check_library_owner_flags_foreign_id() {
        let mut prefs = ITunesPrefs::default();
        prefs.library_link_id = [0xAB; 8];
        assert!(check_library_owner(&prefs).is_some());
    }

    #[test]
    fn padded_string_round_trips() {
        let mut buf = vec![0u8; 64];
        write_padded_string(&mut buf, 0, "hostname", 64);
        assert_eq!(read_padded_string(&buf, 0, 64), "hostname");
    }
}
