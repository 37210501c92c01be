//! MHOD string records (iTunesDB variant): a 24-byte chunk header, a 16-byte
//! string-type header, then the UTF-16LE (or UTF-8) payload.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const MHOD_TITLE: u32 = 1;
pub const MHOD_LOCATION: u32 = 2;
pub const MHOD_ALBUM: u32 = 3;
pub const MHOD_ARTIST: u32 = 4;
pub const MHOD_GENRE: u32 = 5;
pub const MHOD_FILETYPE: u32 = 6;
pub const MHOD_COMMENT: u32 = 8;
pub const MHOD_COMPOSER: u32 = 12;
pub const MHOD_SORT_ARTIST: u32 = 23;
pub const MHOD_SORT_NAME: u32 = 27;
pub const MHOD_SORT_ALBUM: u32 = 28;

/// MHOD type used by a playlist item (MHIP) to record its own index.
pub const MHOD_POSITION: u32 = 104;

/// Album-list (MHIA) string types; numerically distinct from the
/// track-level album(3)/artist(4) MHODs above.
pub const MHOD_ALBUM_NAME: u32 = 200;
pub const MHOD_ALBUM_ARTIST: u32 = 201;
pub const MHOD_SORT_ALBUM_ARTIST: u32 = 202;

const ENCODING_UTF16LE: u32 = 1;

/// Build one MHOD string chunk. `text` is encoded UTF-16LE.
pub fn write_mhod_string(mhod_type: u32, text: &str) -> Vec<u8> {
    let utf16: Vec<u8> = text
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();

    let total_len = 24 + 16 + utf16.len() as u32;

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(24).unwrap(); // header_len
    buf.write_u32::<LittleEndian>(total_len).unwrap();
    buf.write_u32::<LittleEndian>(mhod_type).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap(); // unk1
    buf.write_u32::<LittleEndian>(0).unwrap(); // unk2

    buf.write_u32::<LittleEndian>(ENCODING_UTF16LE).unwrap();
    buf.write_u32::<LittleEndian>(utf16.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(1).unwrap(); // unknown
    buf.write_u32::<LittleEndian>(0).unwrap(); // unknown

    buf.write_all(&utf16).unwrap();
    buf
}

/// Emit the track's mandatory title+location MHODs plus any non-empty
/// optional field MHODs. Returns the concatenated bytes and the count of
/// MHODs written (used for the MHIT header's `mhod_count`).
pub fn write_track_mhods(track: &crate::itunesdb::TrackInfo) -> (Vec<u8>, u32) {
    let mut out = Vec::new();
    let mut count = 0u32;

    out.extend(write_mhod_string(MHOD_TITLE, &track.title));
    count += 1;
    out.extend(write_mhod_string(MHOD_LOCATION, &track.location));
    count += 1;

    let optional: &[(u32, &str)] = &[
        (MHOD_ALBUM, &track.album),
        (MHOD_ARTIST, &track.artist),
        (MHOD_GENRE, &track.genre),
        (MHOD_ALBUM_ARTIST_TRACK, &track.album_artist),
        (MHOD_COMPOSER, &track.composer),
        (MHOD_COMMENT, &track.comment),
        (MHOD_SORT_ARTIST, &track.sort_artist),
        (MHOD_SORT_NAME, &track.sort_name),
        (MHOD_SORT_ALBUM, &track.sort_album),
    ];
    for (ty, value) in optional {
        if !value.is_empty() {
            out.extend(write_mhod_string(*ty, value));
            count += 1;
        }
    }

    (out, count)
}

// Album-artist at track level reuses type 22 in the reference writer; kept
// distinct from the MHIA-level album-artist type (201) above.
const MHOD_ALBUM_ARTIST_TRACK: u32 = 22;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_utf16le_with_correct_total_len() {
        let chunk = write_mhod_string(MHOD_TITLE, "Hi");
        // 24 + 16 + 2*2 = 44
        assert_eq!(chunk.len(), 44);
        assert_eq!(&chunk[0..4], b"mhod");
    }

    #[test]
    fn position_mhod_is_used_for_playlist_items() {
        let chunk = write_mhod_string(MHOD_POSITION, "3");
        assert_eq!(u32::from_le_bytes(chunk[12..16].try_into().unwrap()), MHOD_POSITION);
    }
}
