//! MHLA (album list) / MHIA (album item).
//!
//! One MHIA per unique (album, album_artist) pair, sorted alphabetically by
//! that key and assigned `album_id` starting at 1 via the shared ID counter.

use byteorder::{LittleEndian, WriteBytesExt};
use rand::Rng;
use std::collections::HashMap;
use std::io::Write;

use super::string::{write_mhod_string, MHOD_ALBUM_ARTIST, MHOD_ALBUM_NAME, MHOD_SORT_ALBUM_ARTIST};
use super::TrackInfo;

pub const MHIA_HEADER_SIZE: usize = 88;
pub const MHLA_HEADER_SIZE: usize = 92;

fn write_mhia(album_id: u32, album_name: &str, album_artist: &str) -> Vec<u8> {
    let sql_id: u64 = loop {
        let v: u64 = rand::thread_rng().gen();
        if v != 0 {
            break v;
        }
    };

    let mut children = Vec::new();
    children.extend(write_mhod_string(MHOD_ALBUM_NAME, album_name));
    children.extend(write_mhod_string(MHOD_ALBUM_ARTIST, album_artist));
    children.extend(write_mhod_string(MHOD_SORT_ALBUM_ARTIST, album_artist));

    let mut h = vec![0u8; MHIA_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&3u32.to_le_bytes()); // child_count: 3 MHODs
    h[0x10..0x14].copy_from_slice(&album_id.to_le_bytes());
    h[0x14..0x1C].copy_from_slice(&sql_id.to_le_bytes());
    h[0x1C..0x20].copy_from_slice(&2u32.to_le_bytes()); // unknown, always 2

    crate::chunk::build_chunk(b"mhia", h, &children)
}

/// Assigns `album_id` to every track (mutating `tracks` in place) and
/// returns the finished MHLA chunk. `next_id` is the shared monotonic ID
/// counter described in §4.2; it is advanced by one per unique album.
pub fn write_mhla(tracks: &mut [TrackInfo], next_id: &mut u32) -> Vec<u8> {
    let mut keys: Vec<(String, String)> = Vec::new();
    let mut seen: HashMap<(String, String), ()> = HashMap::new();
    for t in tracks.iter() {
        let key = (t.album.clone(), t.album_artist.clone());
        if seen.insert(key.clone(), ()).is_none() {
            keys.push(key);
        }
    }
    keys.sort();

    let mut album_map: HashMap<(String, String), u32> = HashMap::new();
    let mut children = Vec::new();
    for key in &keys {
        let id = *next_id;
        *next_id += 1;
        album_map.insert(key.clone(), id);
        children.extend(write_mhia(id, &key.0, &key.1));
    }

    for t in tracks.iter_mut() {
        let key = (t.album.clone(), t.album_artist.clone());
        t.album_id = *album_map.get(&key).unwrap_or(&0);
    }

    let mut h = vec![0u8; MHLA_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&(keys.len() as u32).to_le_bytes());
    crate::chunk::build_chunk(b"mhla", h, &children)
}

/// MHSD dataset wrapper, generic over the 4-byte type tag and the already
/// serialized child list chunk (MHLT/MHLP/MHLA).
pub fn write_mhsd(dataset_type: u32, list_chunk: &[u8]) -> Vec<u8> {
    let mut h = vec![0u8; 96];
    h[0x0C..0x10].copy_from_slice(&dataset_type.to_le_bytes());
    crate::chunk::build_chunk(b"mhsd", h, list_chunk)
}

/// An always-empty MHLA, used for the artwork database's unused album-list
/// dataset (distinct header size/convention — see artworkdb module).
pub fn write_mhla_empty() -> Vec<u8> {
    let mut h = vec![0u8; MHLA_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&0u32.to_le_bytes());
    crate::chunk::build_chunk(b"mhla", h, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itunesdb::TrackInfo;

    #[test]
    fn assigns_album_ids_alphabetically() {
        let mut tracks = vec![
            TrackInfo { album: "Zeta".into(), album_artist: "A".into(), ..Default::default() },
            TrackInfo { album: "Alpha".into(), album_artist: "A".into(), ..Default::default() },
        ];
        let mut next_id = 1u32;
        let _ = write_mhla(&mut tracks, &mut next_id);
        assert_eq!(tracks[1].album_id, 1); // Alpha sorts first
        assert_eq!(tracks[0].album_id, 2); // Zeta sorts second
        assert_eq!(next_id, 3);
    }
}
