//! Acoustic fingerprinting: invokes an external Chromaprint-equivalent
//! binary (`fpcalc`) and caches results in the audio file's own tags so
//! later scans don't recompute them.

use std::path::{Path, PathBuf};
use std::process::Command;

use lofty::prelude::*;
use lofty::tag::{ItemKey, Tag};
use log::debug;

use crate::error::DifferError;

const FINGERPRINT_KEY: &str = "ACOUSTID_FINGERPRINT";

pub fn find_fpcalc() -> Option<PathBuf> {
    if let Ok(path) = which_in_path("fpcalc") {
        return Some(path);
    }
    let candidates = ["/usr/local/bin/fpcalc", "/opt/homebrew/bin/fpcalc", "/usr/bin/fpcalc"];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

fn which_in_path(bin: &str) -> Result<PathBuf, ()> {
    let path_var = std::env::var_os("PATH").ok_or(())?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(())
}

pub fn is_fpcalc_available() -> bool {
    find_fpcalc().is_some()
}

/// Run `fpcalc -raw <file>` and parse its `FINGERPRINT=...` stdout line.
/// fpcalc enforces its own decode bound; we don't additionally watchdog it.
pub fn compute_fingerprint(path: &Path, fpcalc: &Path) -> Result<String, DifferError> {
    let output = Command::new(fpcalc)
        .arg("-raw")
        .arg(path)
        .output()
        .map_err(|_| DifferError::FingerprintToolMissing)?;
    if !output.status.success() {
        return Err(DifferError::FingerprintToolMissing);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("FINGERPRINT="))
        .map(|s| s.to_string())
        .ok_or(DifferError::FingerprintToolMissing)
}

pub fn read_fingerprint(path: &Path) -> Option<String> {
    let tagged = lofty::read_from_path(path).ok()?;
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag())?;
    tag.get_string(&ItemKey::from_key(tagged.primary_tag_type(), FINGERPRINT_KEY)).map(|s| s.to_string())
}

pub fn write_fingerprint(path: &Path, fingerprint: &str) -> Result<(), DifferError> {
    let mut tagged = lofty::read_from_path(path).map_err(|_| DifferError::FingerprintToolMissing)?;
    let tag_type = tagged.primary_tag_type();
    if tagged.primary_tag().is_none() {
        tagged.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged.primary_tag_mut().expect("tag was just ensured present");
    let key = ItemKey::from_key(tag_type, FINGERPRINT_KEY);
    tag.insert_text(key, fingerprint.to_string());
    tagged
        .save_to_path(path, lofty::config::WriteOptions::default())
        .map_err(|_| DifferError::FingerprintToolMissing)?;
    Ok(())
}

/// Read an existing fingerprint tag if present; otherwise shell out to
/// `fpcalc` and write the result back.
pub fn get_or_compute_fingerprint(path: &Path, fpcalc: &Path, write_back: bool) -> Result<String, DifferError> {
    if let Some(existing) = read_fingerprint(path) {
        debug!("read existing fingerprint for {}", path.display());
        return Ok(existing);
    }
    let fingerprint = compute_fingerprint(path, fpcalc)?;
    if write_back {
        if let Err(e) = write_fingerprint(path, &fingerprint) {
            debug!("could not store fingerprint in {}: {:?}", path.display(), e);
        }
    }
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_in_path_finds_nothing_with_empty_path() {
        // Smoke test for the PATH-walking helper's empty-input behavior.
        assert!(which_in_path("definitely-not-a-real-binary-xyz").is_err());
    }
}
