//! MHFD assembly: image list, empty album list, file list, plus the
//! `F<id>_1.ithmb` pixel files each image entry points into.

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use super::{ArtFormat, ArtSource, ArtworkJob, ArtworkLink, FORMATS};
use super::rgb565;
use crate::error::SyncError;

const MHFD_HEADER_SIZE: usize = 132;
const MHSD_HEADER_SIZE: usize = 96;
const MHLI_HEADER_SIZE: usize = 92;
const MHLA_HEADER_SIZE: usize = 92;
const MHLF_HEADER_SIZE: usize = 92;
const MHII_HEADER_SIZE: usize = 152;
const MHNI_HEADER_SIZE: usize = 76;
const MHIF_HEADER_SIZE: usize = 124;
const MHOD_ART_HEADER_SIZE: usize = 24;
const MHAF_SIZE: usize = 96;

/// Bytes observed on reference devices for the opaque type-6 `mhaf`
/// sub-chunk. Purpose undocumented; treated as an inert template.
const MHAF_TEMPLATE: [u8; MHAF_SIZE] = [0u8; MHAF_SIZE];

fn write_mhod_filename(filename: &str) -> Vec<u8> {
    let utf16: Vec<u8> = filename.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let str_header_len = 16usize;
    let total_len = MHOD_ART_HEADER_SIZE + str_header_len + utf16.len();

    let mut buf = Vec::with_capacity(total_len);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(MHOD_ART_HEADER_SIZE as u32).unwrap();
    buf.write_u32::<LittleEndian>(total_len as u32).unwrap();
    buf.write_u16::<LittleEndian>(3).unwrap(); // type 3: ithmb filename
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_all(&[0u8; 12]).unwrap();

    buf.write_u32::<LittleEndian>(1).unwrap(); // encoding = UTF-16LE
    buf.write_u32::<LittleEndian>(utf16.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(1).unwrap();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_all(&utf16).unwrap();
    buf
}

fn write_mhod_mhaf() -> Vec<u8> {
    let total_len = MHOD_ART_HEADER_SIZE + MHAF_SIZE;
    let mut buf = Vec::with_capacity(total_len);
    buf.write_all(b"mhod").unwrap();
    buf.write_u32::<LittleEndian>(MHOD_ART_HEADER_SIZE as u32).unwrap();
    buf.write_u32::<LittleEndian>(total_len as u32).unwrap();
    buf.write_u16::<LittleEndian>(6).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_all(&[0u8; 12]).unwrap();

    buf.write_all(b"mhaf").unwrap();
    buf.write_u32::<LittleEndian>(MHAF_SIZE as u32).unwrap();
    buf.write_u32::<LittleEndian>(MHAF_SIZE as u32).unwrap();
    buf.write_all(&MHAF_TEMPLATE[12..]).unwrap();
    buf
}

fn write_mhni(format: &ArtFormat, ithmb_offset: u32, image_size: u32) -> Vec<u8> {
    let filename = format!("F{}_1.ithmb", format.id);
    let mhod = write_mhod_filename(&filename);

    let mut h = vec![0u8; MHNI_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&1u32.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&format.id.to_le_bytes());
    h[0x14..0x18].copy_from_slice(&ithmb_offset.to_le_bytes());
    h[0x18..0x1C].copy_from_slice(&image_size.to_le_bytes());
    h[0x1C..0x1E].copy_from_slice(&0i16.to_le_bytes());
    h[0x1E..0x20].copy_from_slice(&0i16.to_le_bytes());
    h[0x20..0x22].copy_from_slice(&format.height.to_le_bytes());
    h[0x22..0x24].copy_from_slice(&format.width.to_le_bytes());
    h[0x24..0x28].copy_from_slice(&image_size.to_le_bytes());

    let mut out = Vec::new();
    out.write_all(&h).unwrap();
    out.write_all(&mhod).unwrap();
    out
}

fn write_mhii(img_id: u32, song_id: u64, src_img_size: u32, ni_chunks: &[Vec<u8>]) -> Vec<u8> {
    let mhaf = write_mhod_mhaf();
    let child_count = ni_chunks.len() as u32 + 1;

    let mut h = vec![0u8; MHII_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&child_count.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&img_id.to_le_bytes());
    h[0x14..0x1C].copy_from_slice(&song_id.to_le_bytes());
    h[0x30..0x34].copy_from_slice(&src_img_size.to_le_bytes());
    h[0x38..0x3C].copy_from_slice(&9u32.to_le_bytes());
    h[0x3C..0x40].copy_from_slice(&1u32.to_le_bytes());

    let mut out = Vec::new();
    out.write_all(&h).unwrap();
    for ni in ni_chunks {
        out.write_all(ni).unwrap();
    }
    out.write_all(&mhaf).unwrap();
    out
}

fn write_mhif(format: &ArtFormat, total_bytes_written: u32) -> Vec<u8> {
    let filename = format!("F{}_1.ithmb", format.id);
    let mhod = write_mhod_filename(&filename);

    let mut h = vec![0u8; MHIF_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&1u32.to_le_bytes());
    h[0x10..0x14].copy_from_slice(&format.id.to_le_bytes());
    h[0x14..0x18].copy_from_slice(&total_bytes_written.to_le_bytes());

    let mut out = Vec::new();
    out.write_all(&h).unwrap();
    out.write_all(&mhod).unwrap();
    out
}

fn write_mhsd(dataset_type: u32, list_chunk: &[u8]) -> Vec<u8> {
    let mut h = vec![0u8; MHSD_HEADER_SIZE];
    h[0x0C..0x10].copy_from_slice(&dataset_type.to_le_bytes());
    crate::chunk::build_chunk(b"mhsd", h, list_chunk)
}

struct ResolvedImage {
    img_id: u32,
    song_id: u64,
    /// format_id -> encoded pixel bytes, in the order supported formats
    /// were produced for this image.
    pixels: Vec<(u32, Vec<u8>)>,
}

/// Assemble `ArtworkDB` and the per-format `.ithmb` pixel files under
/// `base_dir`. Returns each track dbid's `(img_id, src_img_size)` link for
/// the iTunesDB writer to stamp into the matching `MHIT`.
pub fn write_artworkdb(base_dir: &Path, jobs: &[ArtworkJob]) -> Result<HashMap<u64, ArtworkLink>, SyncError> {
    let mut hash_to_image: HashMap<[u8; 16], usize> = HashMap::new();
    let mut images: Vec<ResolvedImage> = Vec::new();
    let mut links: HashMap<u64, ArtworkLink> = HashMap::new();
    let mut next_img_id: u32 = 1;

    for job in jobs {
        let image_index = if let Some(&idx) = hash_to_image.get(&job.content_hash) {
            idx
        } else {
            let pixels: Vec<(u32, Vec<u8>)> = match &job.source {
                ArtSource::Fresh(bytes) => {
                    let img = image::load_from_memory(bytes)
                        .map_err(|e| SyncError::InvalidDatabaseLayout(format!("undecodable artwork: {e}")))?;
                    FORMATS.iter().map(|fmt| (fmt.id, rgb565::encode(&img, fmt))).collect()
                }
                ArtSource::Preserved(existing) => {
                    FORMATS.iter().filter_map(|fmt| existing.get(&fmt.id).map(|b| (fmt.id, b.clone()))).collect()
                }
            };
            let img_id = next_img_id;
            next_img_id += 1;
            images.push(ResolvedImage { img_id, song_id: job.track_dbid, pixels });
            let idx = images.len() - 1;
            hash_to_image.insert(job.content_hash, idx);
            idx
        };

        let image = &images[image_index];
        let src_img_size = image.pixels.first().map(|(_, b)| b.len()).unwrap_or(0) as u32;
        links.insert(job.track_dbid, ArtworkLink { img_id: image.img_id, src_img_size });
    }

    let mut offsets: HashMap<u32, u32> = FORMATS.iter().map(|f| (f.id, 0u32)).collect();
    let mut ithmb_files: HashMap<u32, Vec<u8>> = FORMATS.iter().map(|f| (f.id, Vec::new())).collect();
    let mut mhii_list = Vec::new();

    for image in &images {
        let mut ni_chunks = Vec::new();
        for fmt in &FORMATS {
            let Some((_, bytes)) = image.pixels.iter().find(|(id, _)| *id == fmt.id) else { continue };
            let offset = *offsets.get(&fmt.id).unwrap();
            ithmb_files.get_mut(&fmt.id).unwrap().extend_from_slice(bytes);
            ni_chunks.push(write_mhni(fmt, offset, bytes.len() as u32));
            *offsets.get_mut(&fmt.id).unwrap() += bytes.len() as u32;
        }
        let src_img_size = image.pixels.first().map(|(_, b)| b.len()).unwrap_or(0) as u32;
        mhii_list.extend(write_mhii(image.img_id, image.song_id, src_img_size, &ni_chunks));
    }

    for (fmt_id, bytes) in &ithmb_files {
        let path = base_dir.join(format!("F{}_1.ithmb", fmt_id));
        std::fs::write(path, bytes)?;
    }

    let mut mhli_h = vec![0u8; MHLI_HEADER_SIZE];
    mhli_h[0x0C..0x10].copy_from_slice(&(images.len() as u32).to_le_bytes());
    let mhli = crate::chunk::build_chunk(b"mhli", mhli_h, &mhii_list);
    let ds_images = write_mhsd(1, &mhli);

    let mut mhla_h = vec![0u8; MHLA_HEADER_SIZE];
    mhla_h[0x0C..0x10].copy_from_slice(&0u32.to_le_bytes());
    let mhla = crate::chunk::build_chunk(b"mhla", mhla_h, &[]);
    let ds_albums = write_mhsd(2, &mhla);

    let mut mhif_list = Vec::new();
    for fmt in &FORMATS {
        let total = ithmb_files.get(&fmt.id).map(|v| v.len()).unwrap_or(0) as u32;
        mhif_list.extend(write_mhif(fmt, total));
    }
    let mut mhlf_h = vec![0u8; MHLF_HEADER_SIZE];
    mhlf_h[0x0C..0x10].copy_from_slice(&(FORMATS.len() as u32).to_le_bytes());
    let mhlf = crate::chunk::build_chunk(b"mhlf", mhlf_h, &mhif_list);
    let ds_files = write_mhsd(3, &mhlf);

    let mut children = Vec::new();
    children.extend(ds_images);
    children.extend(ds_albums);
    children.extend(ds_files);

    let mut root_h = vec![0u8; MHFD_HEADER_SIZE];
    root_h[0x0C..0x10].copy_from_slice(&3u32.to_le_bytes());
    root_h[0x10..0x14].copy_from_slice(&6u32.to_le_bytes());
    root_h[0x1C..0x20].copy_from_slice(&next_img_id.to_le_bytes());
    root_h[0x30..0x34].copy_from_slice(&2u32.to_le_bytes());
    let root = crate::chunk::build_chunk(b"mhfd", root_h, &children);

    let tmp = base_dir.join("ArtworkDB.tmp");
    std::fs::write(&tmp, &root)?;
    std::fs::rename(&tmp, base_dir.join("ArtworkDB"))?;

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artworkdb::ArtworkJob;

    #[test]
    fn identical_hashes_dedupe_to_one_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = image::DynamicImage::new_rgb8(4, 4).into_rgb8();
        for p in img.pixels_mut() {
            *p = image::Rgb([200, 50, 10]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();

        let jobs = vec![
            ArtworkJob { track_dbid: 1, content_hash: [1; 16], source: ArtSource::Fresh(bytes.clone()) },
            ArtworkJob { track_dbid: 2, content_hash: [1; 16], source: ArtSource::Fresh(bytes) },
        ];
        let links = write_artworkdb(dir.path(), &jobs).unwrap();
        assert_eq!(links[&1].img_id, links[&2].img_id);
    }
}
