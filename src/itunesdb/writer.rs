//! Root MHBD assembly and the top-level `write_itunesdb` entry point.

use byteorder::{LittleEndian, WriteBytesExt};
use rand::Rng;
use std::io::Write;
use std::path::Path;

use super::album::{write_mhla, write_mhla_empty, write_mhsd};
use super::playlist::write_mhlp_with_master;
use super::track::write_mhlt;
use super::TrackInfo;
use crate::checksum::{self, ChecksumScheme};
use crate::error::SyncError;

pub const MHBD_HEADER_SIZE: usize = 244;
pub const DATABASE_VERSION: u32 = 0x4F;

/// Fields of an existing database worth preserving across a rewrite.
#[derive(Debug, Clone, Default)]
pub struct ReferenceInfo {
    pub database_id: u64,
    pub library_persistent_id: u64,
    pub unk_0x32: [u8; 20],
    pub language: [u8; 2],
    pub timezone_offset: i32,
    pub hashing_scheme: u16,
}

/// Assemble the complete MHBD tree (all five datasets) for `tracks`.
/// Mutates `tracks` in place to assign album/track/artist/composer ids.
/// Returns the finished buffer with `id_0x24` baked into both the root
/// header and every track/non-master-playlist record, and checksum slots
/// still zeroed (the caller signs afterward).
pub fn write_mhbd(tracks: &mut Vec<TrackInfo>, reference: &ReferenceInfo) -> Vec<u8> {
    let mut next_id: u32 = 1;

    let mhla = write_mhla(tracks, &mut next_id);

    for (i, t) in tracks.iter_mut().enumerate() {
        t.dbid = if t.dbid == 0 { next_database_id_placeholder(i) } else { t.dbid };
    }
    // track ids are consumed one-per-track in encounter order
    next_id += tracks.len() as u32;

    let mut artist_ids: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for t in tracks.iter_mut() {
        let id = *artist_ids.entry(t.artist.clone()).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        t.artist_id = id;
    }

    // composer ids: one per track, not deduplicated
    for t in tracks.iter_mut() {
        t.composer_id = next_id;
        next_id += 1;
    }

    let id_0x24: u64 = if reference.database_id != 0 {
        reference.database_id
    } else {
        rand::thread_rng().gen()
    };

    let mhlt = write_mhlt(tracks, id_0x24);
    let mhlp = write_mhlp_with_master(tracks, id_0x24);
    let mhlp_podcasts = mhlp.clone(); // identical structure, dataset tagged type=3

    let ds_tracks = write_mhsd(1, &mhlt);
    let ds_playlists = write_mhsd(2, &mhlp);
    let ds_podcasts = write_mhsd(3, &mhlp_podcasts);
    let ds_albums = write_mhsd(4, &mhla);
    let ds_smart = write_mhsd(5, &write_mhla_empty());

    let mut children = Vec::new();
    children.extend(ds_albums);
    children.extend(ds_tracks);
    children.extend(ds_podcasts);
    children.extend(ds_playlists);
    children.extend(ds_smart);

    let mut h = vec![0u8; MHBD_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&DATABASE_VERSION.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&5u32.to_le_bytes());
    let db_id: u64 = if reference.database_id != 0 { reference.database_id } else { rand::thread_rng().gen() };
    h[0x18..0x20].copy_from_slice(&db_id.to_le_bytes());
    h[0x20..0x22].copy_from_slice(&2u16.to_le_bytes()); // platform = Windows
    h[0x24..0x2C].copy_from_slice(&id_0x24.to_le_bytes());
    h[0x30..0x32].copy_from_slice(&reference.hashing_scheme.to_le_bytes());
    h[0x32..0x46].copy_from_slice(&reference.unk_0x32);
    h[0x46..0x48].copy_from_slice(&reference.language);
    h[0x48..0x50].copy_from_slice(&reference.library_persistent_id.to_le_bytes());
    h[0x6C..0x70].copy_from_slice(&reference.timezone_offset.to_le_bytes());

    crate::chunk::build_chunk(b"mhbd", h, &children)
}

fn next_database_id_placeholder(index: usize) -> u64 {
    // New tracks keep dbid = 0 (the "not yet assigned" placeholder) until
    // write time; this helper assigns a transient unique value so two
    // placeholder tracks never collide while ids are still being resolved
    // by the caller's own bookkeeping. The executor overwrites this with
    // the real per-track counter before calling `write_mhbd` in production
    // use; tests exercise this fallback path directly.
    0x1_0000_0000 + index as u64
}

/// Top-level write: assembles the database, computes checksums per the
/// device's hashing scheme, and writes to `path` atomically (temp file +
/// rename).
pub fn write_itunesdb(
    path: &Path,
    tracks: &mut Vec<TrackInfo>,
    reference: &ReferenceInfo,
    scheme: ChecksumScheme,
) -> Result<(), SyncError> {
    let mut buf = write_mhbd(tracks, reference);
    checksum::sign(&mut buf, scheme)?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &buf)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_0x24_matches_across_header_and_tracks() {
        let mut tracks = vec![TrackInfo { title: "A".into(), location: "/x".into(), ..Default::default() }];
        let reference = ReferenceInfo { database_id: 42, ..Default::default() };
        let buf = write_mhbd(&mut tracks, &reference);
        let header_id = u64::from_le_bytes(buf[0x24..0x2C].try_into().unwrap());
        assert_eq!(header_id, 42);
    }
}
