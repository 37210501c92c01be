//! MHIT track record: 0x248-byte header + child MHOD string records.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use super::string::write_track_mhods;
use super::{unix_to_mac_epoch, TrackInfo};

pub const MHIT_HEADER_SIZE: usize = 0x248;

/// Write one MHIT chunk (header + child MHODs) for `track`.
///
/// `track_number_1based` is the track's position in the tracks dataset
/// (used only as the `track_id` field, distinct from the user-facing
/// track/disc numbers already on `TrackInfo`).
pub fn write_mhit(track: &TrackInfo, track_number_1based: u32, id_0x24: u64) -> Vec<u8> {
    let (mhods, mhod_count) = write_track_mhods(track);
    let total_len = MHIT_HEADER_SIZE as u32 + mhods.len() as u32;

    let mut h = vec![0u8; MHIT_HEADER_SIZE];
    h[0..4].copy_from_slice(b"mhit");
    h[4..8].copy_from_slice(&(MHIT_HEADER_SIZE as u32).to_le_bytes());
    h[8..12].copy_from_slice(&total_len.to_le_bytes());
    h[0x0C..0x10].copy_from_slice(&mhod_count.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&track_number_1based.to_le_bytes());
    h[0x14] = 1; // visible
    h[0x18..0x1C].copy_from_slice(&u32::from_be_bytes(track.filetype_code));
    h[0x1C] = if track.vbr { 1 } else { 0 };
    h[0x1D] = 1; // type2
    h[0x1E] = if track.compilation { 1 } else { 0 };
    h[0x1F] = track.rating;

    let time_modified = unix_to_mac_epoch(track.date_added_unix);
    h[0x20..0x24].copy_from_slice(&time_modified.to_le_bytes());
    h[0x24..0x28].copy_from_slice(&track.size_bytes.to_le_bytes());
    h[0x28..0x2C].copy_from_slice(&track.duration_ms.to_le_bytes());
    h[0x2C..0x30].copy_from_slice(&track.track_number.to_le_bytes());
    h[0x30..0x34].copy_from_slice(&track.total_tracks.to_le_bytes());
    h[0x34..0x38].copy_from_slice(&track.year.to_le_bytes());
    h[0x38..0x3C].copy_from_slice(&track.bitrate.to_le_bytes());
    h[0x3C..0x40].copy_from_slice(&(track.sample_rate << 16).to_le_bytes());
    h[0x40..0x44].copy_from_slice(&0i32.to_le_bytes()); // volume
    h[0x44..0x48].copy_from_slice(&0u32.to_le_bytes()); // start_time
    h[0x48..0x4C].copy_from_slice(&0u32.to_le_bytes()); // stop_time
    h[0x50..0x54].copy_from_slice(&track.play_count.to_le_bytes());
    // 0x54 play_count_since_sync always zeroed on write
    let last_played = unix_to_mac_epoch(track.last_played_unix);
    h[0x58..0x5C].copy_from_slice(&last_played.to_le_bytes());
    h[0x5C..0x60].copy_from_slice(&track.disc_number.to_le_bytes());
    h[0x60..0x64].copy_from_slice(&track.total_discs.to_le_bytes());
    let date_added = unix_to_mac_epoch(track.date_added_unix);
    h[0x68..0x6C].copy_from_slice(&date_added.to_le_bytes());
    h[0x70..0x78].copy_from_slice(&track.dbid.to_le_bytes());
    h[0x78] = 0; // checked
    h[0x79] = 0; // app_rating
    h[0x7C..0x7E].copy_from_slice(&(if track.has_artwork { 1u16 } else { 0 }).to_le_bytes());
    h[0x7E..0x80].copy_from_slice(&0xFFFFu16.to_le_bytes());
    h[0x80..0x84].copy_from_slice(&track.artwork_size.to_le_bytes());
    h[0x88..0x8C].copy_from_slice(&(track.sample_rate as f32).to_le_bytes());
    let date_released = unix_to_mac_epoch(track.date_released_unix);
    h[0x8C..0x90].copy_from_slice(&date_released.to_le_bytes());
    h[0x9C..0xA0].copy_from_slice(&track.skip_count.to_le_bytes());
    let last_skipped = unix_to_mac_epoch(track.last_skipped_unix);
    h[0xA0..0xA4].copy_from_slice(&last_skipped.to_le_bytes());
    h[0xA4] = if track.has_artwork { 1 } else { 2 };
    h[0xA8..0xB0].copy_from_slice(&track.dbid.to_le_bytes()); // dbid2
    h[0xB2] = if track.mark_unplayed { 0x02 } else { 0x01 };
    h[0xD0..0xD4].copy_from_slice(&track.media_type.as_u32().to_le_bytes());
    h[0x120..0x124].copy_from_slice(&track.album_id.to_le_bytes());
    h[0x124..0x12C].copy_from_slice(&id_0x24.to_le_bytes());
    h[0x12C..0x130].copy_from_slice(&track.size_bytes.to_le_bytes());
    h[0x134..0x13C].copy_from_slice(&0x8080808080808080u64.to_le_bytes());
    h[0x160..0x168].copy_from_slice(&track.mhii_link.to_le_bytes());
    h[0x168..0x170].copy_from_slice(&1u64.to_le_bytes());
    h[0x1E0..0x1E4].copy_from_slice(&track.artist_id.to_le_bytes());
    h[0x1F4..0x1F8].copy_from_slice(&track.composer_id.to_le_bytes());

    let mut out = Vec::with_capacity(total_len as usize);
    out.write_all(&h).unwrap();
    out.write_all(&mhods).unwrap();
    out
}

/// MHLT: track list wrapper. `header_len` is fixed at 92 bytes on reference
/// devices; children are the concatenated MHIT chunks.
pub fn write_mhlt(tracks: &[TrackInfo], id_0x24: u64) -> Vec<u8> {
    let mut children = Vec::new();
    for (i, t) in tracks.iter().enumerate() {
        children.extend(write_mhit(t, (i + 1) as u32, id_0x24));
    }

    let mut h = vec![0u8; 92];
    h[0..4].copy_from_slice(b"mhlt");
    h[0x0C..0x10].copy_from_slice(&(tracks.len() as u32).to_le_bytes());

    crate::chunk::build_chunk(b"mhlt", h, &children)
}
