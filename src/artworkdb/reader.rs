//! ArtworkDB reader: recovers per-track preserved pixel bytes so a track
//! with no PC-side art match this sync keeps its existing artwork.

use std::collections::HashMap;
use std::path::Path;

use crate::chunk::{iter_siblings, read_chunk};
use crate::error::SyncError;

/// Raw per-format pixel bytes for one previously written image, keyed by
/// the `dbid` (song_id) recorded in its `MHII` entry.
pub struct PreservedArt {
    pub formats: HashMap<u32, Vec<u8>>,
}

/// Parse an existing `ArtworkDB` plus its sibling `.ithmb` pixel files in
/// `base_dir`, returning a `dbid -> PreservedArt` map.
///
/// This walks the chunk tree with the same generic codec used for
/// iTunesDB, then follows each `MHNI`'s recorded ithmb offset/length to
/// slice the actual pixel bytes out of the corresponding `.ithmb` file —
/// the chunk codec alone only gives us the index, not the pixels.
pub fn parse_artworkdb(base_dir: &Path) -> Result<HashMap<u64, PreservedArt>, SyncError> {
    let db_path = base_dir.join("ArtworkDB");
    if !db_path.exists() {
        return Ok(HashMap::new());
    }
    let buf = std::fs::read(&db_path)?;
    if buf.len() < 132 {
        return Err(SyncError::InvalidDatabaseLayout("ArtworkDB shorter than MHFD header".into()));
    }

    let mut ithmb_cache: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut out: HashMap<u64, PreservedArt> = HashMap::new();

    let root = read_chunk(&buf, 0)?;
    if &root.tag != b"mhfd" {
        return Err(SyncError::InvalidDatabaseLayout("missing mhfd root".into()));
    }

    for dataset in iter_siblings(root.children, 0, root.children.len()) {
        if &dataset.tag != b"mhsd" {
            continue;
        }
        let dataset_type = u32::from_le_bytes(dataset.header[0x0C..0x10].try_into().unwrap());
        if dataset_type != 1 {
            continue;
        }
        for list in iter_siblings(dataset.children, 0, dataset.children.len()) {
            if &list.tag != b"mhli" {
                continue;
            }
            for item in iter_siblings(list.children, 0, list.children.len()) {
                if &item.tag != b"mhii" {
                    continue;
                }
                let h = item.header;
                if h.len() < 0x40 {
                    continue;
                }
                let song_id = u64::from_le_bytes(h[0x14..0x1C].try_into().unwrap());

                let mut formats = HashMap::new();
                for ni in iter_siblings(item.children, 0, item.children.len()) {
                    if &ni.tag != b"mhni" {
                        continue;
                    }
                    let nh = ni.header;
                    if nh.len() < 0x28 {
                        continue;
                    }
                    let format_id = u32::from_le_bytes(nh[0x10..0x14].try_into().unwrap());
                    let offset = u32::from_le_bytes(nh[0x14..0x18].try_into().unwrap()) as usize;
                    let size = u32::from_le_bytes(nh[0x18..0x1C].try_into().unwrap()) as usize;

                    let ithmb = ithmb_cache.entry(format_id).or_insert_with(|| {
                        std::fs::read(base_dir.join(format!("F{}_1.ithmb", format_id))).unwrap_or_default()
                    });
                    if let Some(pixels) = ithmb.get(offset..offset + size) {
                        formats.insert(format_id, pixels.to_vec());
                    }
                }
                if !formats.is_empty() {
                    out.insert(song_id, PreservedArt { formats });
                }
            }
        }
    }

    Ok(out)
}
