//! Minimal iTunesDB parser: enough to recover the track list and the
//! header fields worth preserving across a rewrite (database id, library
//! persistent id, hashing scheme, the opaque unk_0x32 bytes, timezone).
//!
//! This is deliberately not a full round-trip parser — it reads what the
//! differ and writer need (§8 testable property 1 enumerates timestamps
//! and freshly assigned ids as expected divergences on a full round-trip;
//! this reader only recovers the subset those properties don't cover).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

use log::debug;

use super::writer::{ReferenceInfo, MHBD_HEADER_SIZE};
use super::{mac_epoch_to_unix, MediaType, TrackInfo};
use crate::chunk::{read_chunk, read_chunk_in_context, RawChunk};
use crate::error::SyncError;

/// Walk `buf[start..end]` as a run of sibling chunks, each required to carry
/// one of `valid_tags`. Mirrors `chunk::iter_siblings` but surfaces a tag
/// outside the allow-list as `InvalidMagic` instead of treating it as the
/// end of the run.
fn siblings_in_context<'a>(
    buf: &'a [u8],
    start: usize,
    end: usize,
    valid_tags: &[[u8; 4]],
) -> Result<Vec<RawChunk<'a>>, SyncError> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos + 12 <= end {
        let chunk = read_chunk_in_context(buf, pos, valid_tags)?;
        pos += chunk.total_len;
        out.push(chunk);
    }
    Ok(out)
}

pub struct ParsedDatabase {
    pub reference: ReferenceInfo,
    pub tracks: Vec<TrackInfo>,
}

pub fn parse_itunesdb(path: &Path) -> Result<ParsedDatabase, SyncError> {
    let buf = std::fs::read(path)?;
    parse_itunesdb_bytes(&buf)
}

pub fn parse_itunesdb_bytes(buf: &[u8]) -> Result<ParsedDatabase, SyncError> {
    if buf.len() < MHBD_HEADER_SIZE {
        return Err(SyncError::InvalidDatabaseLayout("buffer shorter than MHBD header".into()));
    }
    let root = read_chunk(buf, 0)?;
    if &root.tag != b"mhbd" {
        return Err(SyncError::InvalidDatabaseLayout("missing mhbd root".into()));
    }

    let reference = ReferenceInfo {
        database_id: u64::from_le_bytes(root.header[0x18..0x20].try_into().unwrap()),
        library_persistent_id: u64::from_le_bytes(root.header[0x48..0x50].try_into().unwrap()),
        unk_0x32: root.header[0x32..0x46].try_into().unwrap(),
        language: root.header[0x46..0x48].try_into().unwrap(),
        timezone_offset: i32::from_le_bytes(root.header[0x6C..0x70].try_into().unwrap()),
        hashing_scheme: u16::from_le_bytes(root.header[0x30..0x32].try_into().unwrap()),
    };

    let mut tracks = Vec::new();
    for dataset in siblings_in_context(root.children, 0, root.children.len(), &[*b"mhsd"])? {
        let dataset_type = u32::from_le_bytes(dataset.header[0x0C..0x10].try_into().unwrap());
        if dataset_type != 1 {
            continue;
        }
        for list in siblings_in_context(dataset.children, 0, dataset.children.len(), &[*b"mhlt"])? {
            for item in siblings_in_context(list.children, 0, list.children.len(), &[*b"mhit"])? {
                tracks.push(parse_mhit(&item)?);
            }
        }
    }

    Ok(ParsedDatabase { reference, tracks })
}

fn parse_mhit(chunk: &crate::chunk::RawChunk<'_>) -> Result<TrackInfo, SyncError> {
    let h = chunk.header;
    if h.len() < 0x1F8 {
        return Err(SyncError::InvalidDatabaseLayout("mhit header too short".into()));
    }

    let mut track = TrackInfo {
        dbid: u64::from_le_bytes(h[0x70..0x78].try_into().unwrap()),
        rating: h[0x1F],
        size_bytes: u32::from_le_bytes(h[0x24..0x28].try_into().unwrap()),
        duration_ms: u32::from_le_bytes(h[0x28..0x2C].try_into().unwrap()),
        track_number: u32::from_le_bytes(h[0x2C..0x30].try_into().unwrap()),
        total_tracks: u32::from_le_bytes(h[0x30..0x34].try_into().unwrap()),
        year: u32::from_le_bytes(h[0x34..0x38].try_into().unwrap()),
        bitrate: u32::from_le_bytes(h[0x38..0x3C].try_into().unwrap()),
        sample_rate: u32::from_le_bytes(h[0x3C..0x40].try_into().unwrap()) >> 16,
        play_count: u32::from_le_bytes(h[0x50..0x54].try_into().unwrap()),
        play_count_since_sync: u32::from_le_bytes(h[0x54..0x58].try_into().unwrap()),
        last_played_unix: mac_epoch_to_unix(u32::from_le_bytes(h[0x58..0x5C].try_into().unwrap())),
        disc_number: u32::from_le_bytes(h[0x5C..0x60].try_into().unwrap()),
        total_discs: u32::from_le_bytes(h[0x60..0x64].try_into().unwrap()),
        date_added_unix: mac_epoch_to_unix(u32::from_le_bytes(h[0x68..0x6C].try_into().unwrap())),
        skip_count: u32::from_le_bytes(h[0x9C..0xA0].try_into().unwrap()),
        last_skipped_unix: mac_epoch_to_unix(u32::from_le_bytes(h[0xA0..0xA4].try_into().unwrap())),
        has_artwork: h[0xA4] == 1,
        media_type: MediaType::from_u32(u32::from_le_bytes(h[0xD0..0xD4].try_into().unwrap())),
        album_id: u32::from_le_bytes(h[0x120..0x124].try_into().unwrap()),
        mhii_link: u64::from_le_bytes(h[0x160..0x168].try_into().unwrap()),
        artwork_size: u32::from_le_bytes(h[0x80..0x84].try_into().unwrap()),
        artist_id: u32::from_le_bytes(h[0x1E0..0x1E4].try_into().unwrap()),
        composer_id: u32::from_le_bytes(h[0x1F4..0x1F8].try_into().unwrap()),
        compilation: h[0x1E] != 0,
        vbr: h[0x1C] != 0,
        mark_unplayed: h[0xB2] == 0x02,
        ..Default::default()
    };

    for mhod in siblings_in_context(chunk.children, 0, chunk.children.len(), &[*b"mhod"])? {
        if let Some((mhod_type, text)) = parse_mhod_string(&mhod) {
            match mhod_type {
                1 => track.title = text,
                2 => track.location = text,
                3 => track.album = text,
                4 => track.artist = text,
                5 => track.genre = text,
                8 => track.comment = text,
                12 => track.composer = text,
                22 => track.album_artist = text,
                23 => track.sort_artist = text,
                27 => track.sort_name = text,
                28 => track.sort_album = text,
                other => debug!("ignoring unhandled mhod_type {other} in mhit"),
            }
        }
    }

    Ok(track)
}

fn parse_mhod_string(chunk: &crate::chunk::RawChunk<'_>) -> Option<(u32, String)> {
    let h = chunk.header;
    if h.len() < 24 {
        return None;
    }
    let mhod_type = u32::from_le_bytes(h[0x0C..0x10].try_into().unwrap());
    let body = chunk.children;
    if body.len() < 16 {
        return None;
    }
    let mut cur = Cursor::new(&body[0..8]);
    let encoding = cur.read_u32::<LittleEndian>().ok()?;
    let str_len = cur.read_u32::<LittleEndian>().ok()? as usize;
    let str_bytes = body.get(16..16 + str_len)?;

    let text = if encoding == 1 {
        let units: Vec<u16> = str_bytes.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(str_bytes).into_owned()
    };
    Some((mhod_type, text))
}
