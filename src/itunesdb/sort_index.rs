//! Library sort indices (MHOD types 52/53) carried only by the master
//! playlist. These drive the on-device Songs/Artists/Albums/Genres
//! browsers; without them the iPod shows an empty library.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use super::TrackInfo;

const SORT_TITLE: u32 = 0x03;
const SORT_ALBUM: u32 = 0x04;
const SORT_ARTIST: u32 = 0x05;
const SORT_GENRE: u32 = 0x07;
const SORT_COMPOSER: u32 = 0x12;

const ALL_SORT_TYPES: [u32; 5] = [SORT_TITLE, SORT_ALBUM, SORT_ARTIST, SORT_GENRE, SORT_COMPOSER];

fn fold(s: &str) -> String {
    let lower = s.to_lowercase();
    lower.strip_prefix("the ").unwrap_or(&lower).to_string()
}

fn sort_key(track: &TrackInfo, category: u32) -> Vec<String> {
    match category {
        SORT_TITLE => vec![fold(&track.title)],
        SORT_ALBUM => vec![
            fold(&track.album),
            format!("{:010}", track.disc_number),
            format!("{:010}", track.track_number),
            fold(&track.title),
        ],
        SORT_ARTIST => vec![
            fold(&track.artist),
            fold(&track.album),
            format!("{:010}", track.disc_number),
            format!("{:010}", track.track_number),
            fold(&track.title),
        ],
        SORT_GENRE => vec![
            fold(&track.genre),
            fold(&track.artist),
            fold(&track.album),
            format!("{:010}", track.disc_number),
            format!("{:010}", track.track_number),
            fold(&track.title),
        ],
        SORT_COMPOSER => vec![
            fold(&track.composer),
            fold(&track.album),
            format!("{:010}", track.disc_number),
            format!("{:010}", track.track_number),
            fold(&track.title),
        ],
        _ => vec![],
    }
}

fn jump_field<'a>(track: &'a TrackInfo, category: u32) -> &'a str {
    match category {
        SORT_TITLE => &track.title,
        SORT_ALBUM => &track.album,
        SORT_ARTIST => {
            if track.sort_artist.is_empty() {
                &track.artist
            } else {
                &track.sort_artist
            }
        }
        SORT_GENRE => &track.genre,
        SORT_COMPOSER => &track.composer,
        _ => "",
    }
}

fn jump_letter(field: &str) -> u16 {
    match field.chars().find(|c| c.is_alphanumeric()) {
        Some(c) if c.is_ascii_digit() => '0' as u16,
        Some(c) => c.to_ascii_uppercase() as u16,
        None => '0' as u16,
    }
}

fn write_type52(category: u32, order: &[u32]) -> Vec<u8> {
    let count = order.len() as u32;
    let total_len = 24 + 48 + 4 * count;

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(24).unwrap();
    buf.write_u32::<LittleEndian>(total_len).unwrap();
    buf.write_u32::<LittleEndian>(52).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();

    buf.write_u32::<LittleEndian>(category).unwrap();
    buf.write_u32::<LittleEndian>(count).unwrap();
    buf.write_all(&[0u8; 40]).unwrap();

    for &idx in order {
        buf.write_u32::<LittleEndian>(idx).unwrap();
    }
    buf
}

fn write_type53(category: u32, jumps: &[(u16, u32, u32)]) -> Vec<u8> {
    let count = jumps.len() as u32;
    let total_len = 24 + 16 + 12 * count;

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(24).unwrap();
    buf.write_u32::<LittleEndian>(total_len).unwrap();
    buf.write_u32::<LittleEndian>(53).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();

    buf.write_u32::<LittleEndian>(category).unwrap();
    buf.write_u32::<LittleEndian>(count).unwrap();
    buf.write_all(&[0u8; 8]).unwrap();

    for &(letter, start, cnt) in jumps {
        buf.write_u16::<LittleEndian>(letter).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(start).unwrap();
        buf.write_u32::<LittleEndian>(cnt).unwrap();
    }
    buf
}

fn build_category(tracks: &[TrackInfo], category: u32) -> (Vec<u8>, Vec<u8>) {
    let mut indexed: Vec<(Vec<String>, usize)> =
        tracks.iter().enumerate().map(|(i, t)| (sort_key(t, category), i)).collect();
    indexed.sort_by(|a, b| a.0.cmp(&b.0));

    let order: Vec<u32> = indexed.iter().map(|(_, i)| *i as u32).collect();

    let mut jumps: Vec<(u16, u32, u32)> = Vec::new();
    for (pos, (_, orig_idx)) in indexed.iter().enumerate() {
        let letter = jump_letter(jump_field(&tracks[*orig_idx], category));
        match jumps.last_mut() {
            Some((last_letter, _start, count)) if *last_letter == letter => {
                *count += 1;
            }
            _ => jumps.push((letter, pos as u32, 1)),
        }
    }

    (write_type52(category, &order), write_type53(category, &jumps))
}

/// Emit the ten library-index MHODs (type-52 then type-53 for each of the
/// five sort categories, in the fixed order title/album/artist/genre/composer).
/// Returns `(bytes, mhod_count)`; `(b"", 0)` when `tracks` is empty.
pub fn write_library_indices(tracks: &[TrackInfo]) -> (Vec<u8>, u32) {
    if tracks.is_empty() {
        return (Vec::new(), 0);
    }
    let mut out = Vec::new();
    for category in ALL_SORT_TYPES {
        let (t52, t53) = build_category(tracks, category);
        out.extend(t52);
        out.extend(t53);
    }
    (out, 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itunesdb::TrackInfo;

    #[test]
    fn empty_track_list_emits_nothing() {
        let (bytes, count) = write_library_indices(&[]);
        assert!(bytes.is_empty());
        assert_eq!(count, 0);
    }

    #[test]
    fn emits_ten_mhods_for_nonempty_list() {
        let tracks = vec![
            TrackInfo { title: "Beta".into(), ..Default::default() },
            TrackInfo { title: "Alpha".into(), ..Default::default() },
        ];
        let (bytes, count) = write_library_indices(&tracks);
        assert_eq!(count, 10);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn the_prefix_is_stripped_for_sort_keying() {
        assert_eq!(fold("The Beatles"), "beatles");
    }
}
