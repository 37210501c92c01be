//! MHLP (playlist list) / MHYP (playlist) / MHIP (playlist item).
//!
//! iTunes writes a 184-byte MHYP header; the 108-byte libgpod layout is
//! rejected by the iPod Classic firmware and must never be used here.

use byteorder::{LittleEndian, WriteBytesExt};
use rand::Rng;
use std::io::Write;

use super::sort_index::write_library_indices;
use super::string::{write_mhod_string, MHOD_POSITION, MHOD_TITLE};
use super::{unix_to_mac_epoch, TrackInfo};

pub const MHYP_HEADER_SIZE: usize = 184;
pub const MHIP_HEADER_SIZE: usize = 76;
pub const MHLP_HEADER_SIZE: usize = 92;

/// The 648-byte "playlist preferences" MHOD (type 100). Its internal fields
/// are undocumented even in the reference implementation (marked `?` in the
/// source); it is treated as an opaque template and copied byte-for-byte.
fn write_playlist_prefs_mhod() -> Vec<u8> {
    const BODY_LEN: usize = 648 - 24;
    let mut body = vec![0u8; BODY_LEN];

    let put_u32 = |body: &mut [u8], off: usize, val: u32| {
        body[off..off + 4].copy_from_slice(&val.to_le_bytes());
    };

    put_u32(&mut body, 0x30, 0x010084);
    put_u32(&mut body, 0x34, 5);
    put_u32(&mut body, 0x38, 9);
    put_u32(&mut body, 0x3C, 3);
    put_u32(&mut body, 0x40, 0x120001);
    put_u32(&mut body, 0x4C, 0x640014);
    body[0x50] = 1;
    body[0x60] = 1;
    body[0x70] = 1;
    body[0x80] = 1;
    body[0x90] = 1;
    put_u32(&mut body, 0x54, 0x320014);
    put_u32(&mut body, 0x64, 0x5a0014);
    put_u32(&mut body, 0x74, 0x500014);
    put_u32(&mut body, 0x84, 0x7d0015);

    let mut buf = Vec::with_capacity(648);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(24).unwrap();
    buf.write_u32::<LittleEndian>(648).unwrap();
    buf.write_u32::<LittleEndian>(100).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_all(&body).unwrap();
    buf
}

fn write_mhip(track_index_1based: u32, dbid: u64, position: u32) -> Vec<u8> {
    let position_mhod = write_mhod_string(MHOD_POSITION, &position.to_string());
    let total_len = MHIP_HEADER_SIZE as u32 + position_mhod.len() as u32;

    let mut h = vec![0u8; MHIP_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&1u32.to_le_bytes()); // mhod_count
    h[0x10..0x14].copy_from_slice(&track_index_1based.to_le_bytes());
    h[0x2C..0x34].copy_from_slice(&dbid.to_le_bytes());

    let mut out = Vec::with_capacity(total_len as usize);
    out.write_all(&h).unwrap();
    out.write_all(&position_mhod).unwrap();
    out
}

pub struct PlaylistSpec<'a> {
    pub name: &'a str,
    pub is_master: bool,
    pub track_dbids: &'a [u64],
}

/// Build one MHYP chunk. `tracks` is only consulted (for the library
/// indices) when `spec.is_master` is true.
pub fn write_mhyp(spec: &PlaylistSpec<'_>, id_0x24: u64, tracks: &[TrackInfo]) -> Vec<u8> {
    let mut children = Vec::new();
    let title_mhod = write_mhod_string(MHOD_TITLE, spec.name);
    children.extend(&title_mhod);
    let prefs_mhod = write_playlist_prefs_mhod();
    children.extend(&prefs_mhod);

    let mut mhod_count = 2u32;
    if spec.is_master {
        let (lib_bytes, lib_count) = write_library_indices(tracks);
        children.extend(lib_bytes);
        mhod_count += lib_count;
    }

    for (i, &dbid) in spec.track_dbids.iter().enumerate() {
        children.extend(write_mhip((i + 1) as u32, dbid, i as u32));
    }

    let playlist_id: u64 = rand::thread_rng().gen();
    let now = unix_to_mac_epoch(crate::utils::current_unix_time());

    let mut h = vec![0u8; MHYP_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&mhod_count.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&(spec.track_dbids.len() as u32).to_le_bytes());
    h[0x14..0x18].copy_from_slice(&(if spec.is_master { 1u32 } else { 0 }).to_le_bytes());
    h[0x18..0x1C].copy_from_slice(&now.to_le_bytes());
    h[0x1C..0x24].copy_from_slice(&playlist_id.to_le_bytes());
    h[0x28..0x2A].copy_from_slice(&1u16.to_le_bytes()); // string_mhod_count
    h[0x2C..0x30].copy_from_slice(&(if spec.is_master { 5u32 } else { 0 }).to_le_bytes());
    if !spec.is_master {
        h[0x3C..0x44].copy_from_slice(&id_0x24.to_le_bytes());
        h[0x44..0x4C].copy_from_slice(&playlist_id.to_le_bytes());
    }
    h[0x58..0x5C].copy_from_slice(&now.to_le_bytes());

    crate::chunk::build_chunk(b"mhyp", h, &children)
}

/// Build the playlist dataset's MHLP wrapper. `master_first` controls
/// whether the master playlist is ordered first (always true for the
/// playlists dataset; the podcast dataset reuses this same structure).
pub fn write_mhlp(playlists: &[Vec<u8>]) -> Vec<u8> {
    let mut children = Vec::new();
    for p in playlists {
        children.extend(p);
    }

    let mut h = vec![0u8; MHLP_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&(playlists.len() as u32).to_le_bytes());
    crate::chunk::build_chunk(b"mhlp", h, &children)
}

/// Convenience entry point: build the master playlist plus zero or more
/// regular playlists, wrapped in a single MHLP.
pub fn write_mhlp_with_master(tracks: &[TrackInfo], id_0x24: u64) -> Vec<u8> {
    let dbids: Vec<u64> = tracks.iter().map(|t| t.dbid).collect();
    let master = write_mhyp(
        &PlaylistSpec { name: "iPod", is_master: true, track_dbids: &dbids },
        id_0x24,
        tracks,
    );
    write_mhlp(&[master])
}
