//! Generic tagged, length-prefixed chunk codec shared by iTunesDB and ArtworkDB.
//!
//! A chunk is `tag(4) ++ header_len(4, LE) ++ total_len(4, LE) ++ rest-of-header ++ children`.
//! `header_len` covers the tag and both length fields; `total_len` covers the
//! whole chunk including children. Both databases nest chunks the same way,
//! so the walking logic lives here once.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::ChunkError;

/// A parsed chunk: its 4-byte tag plus the byte ranges of its header and
/// full body within the original buffer. Borrowing the buffer keeps this
/// codec agnostic to field semantics — callers reinterpret `header` and
/// `children` however the tag dictates.
pub struct RawChunk<'a> {
    pub tag: [u8; 4],
    pub header: &'a [u8],
    pub children: &'a [u8],
    pub total_len: usize,
}

/// Read one chunk starting at `offset` in `buf`.
///
/// `payload_slice = buf[offset+header_len .. offset+total_len]`. The caller
/// advances to the next sibling using `total_len`, and recurses into
/// children starting at `offset + header_len`.
pub fn read_chunk(buf: &[u8], offset: usize) -> Result<RawChunk<'_>, ChunkError> {
    if offset + 12 > buf.len() {
        return Err(ChunkError::TruncatedChunk { offset, total_len: 12, buf_len: buf.len() });
    }
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&buf[offset..offset + 4]);

    let mut cur = Cursor::new(&buf[offset + 4..offset + 12]);
    let header_len = cur.read_u32::<LittleEndian>().unwrap() as usize;
    let total_len = cur.read_u32::<LittleEndian>().unwrap() as usize;

    if header_len > total_len {
        return Err(ChunkError::InconsistentLengths { offset, header_len, total_len });
    }
    if offset + total_len > buf.len() {
        return Err(ChunkError::TruncatedChunk { offset, total_len, buf_len: buf.len() });
    }
    if offset + header_len > buf.len() {
        return Err(ChunkError::TruncatedChunk { offset, total_len: header_len, buf_len: buf.len() });
    }

    Ok(RawChunk {
        tag,
        header: &buf[offset..offset + header_len],
        children: &buf[offset + header_len..offset + total_len],
        total_len,
    })
}

/// Read one chunk at `offset`, additionally requiring its tag to be one of
/// `valid_tags` for this parent context. Per §4.1, a tag unknown in its
/// parent context is `InvalidMagic`, not a silently skipped sibling.
pub fn read_chunk_in_context<'a>(
    buf: &'a [u8],
    offset: usize,
    valid_tags: &[[u8; 4]],
) -> Result<RawChunk<'a>, ChunkError> {
    let chunk = read_chunk(buf, offset)?;
    if !valid_tags.contains(&chunk.tag) {
        return Err(ChunkError::InvalidMagic { tag: chunk.tag, offset });
    }
    Ok(chunk)
}

/// Iterate sibling chunks in `buf[start..end]`, stopping at the first chunk
/// that doesn't fully fit (trailing padding is tolerated, per the on-wire
/// format note: advance by `total_len`, never by counting children).
pub fn iter_siblings(buf: &[u8], start: usize, end: usize) -> SiblingIter<'_> {
    SiblingIter { buf, pos: start, end }
}

pub struct SiblingIter<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Iterator for SiblingIter<'a> {
    type Item = RawChunk<'a>;

    fn next(&mut self) -> Option<RawChunk<'a>> {
        if self.pos + 12 > self.end {
            return None;
        }
        match read_chunk(self.buf, self.pos) {
            Ok(chunk) => {
                self.pos += chunk.total_len;
                Some(chunk)
            }
            Err(_) => None,
        }
    }
}

/// Bottom-up chunk builder: given a tag, a zero-padded fixed header buffer
/// (sized to the tag's constant header length), and an already-assembled
/// children blob, patch in `header_len`/`total_len` and emit the finished
/// bytes.
///
/// `header` must already have its header_len/total_len fields present (any
/// placeholder value) at bytes [4..8] and [8..12]; they are overwritten here.
pub fn build_chunk(tag: &[u8; 4], mut header: Vec<u8>, children: &[u8]) -> Vec<u8> {
    let header_len = header.len() as u32;
    let total_len = header.len() as u32 + children.len() as u32;
    header[0..4].copy_from_slice(tag);
    header[4..8].copy_from_slice(&header_len.to_le_bytes());
    header[8..12].copy_from_slice(&total_len.to_le_bytes());
    header.extend_from_slice(children);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_chunk() {
        let header = vec![0u8; 12];
        let children = b"hello".to_vec();
        let bytes = build_chunk(b"tEst", header, &children);
        let chunk = read_chunk(&bytes, 0).unwrap();
        assert_eq!(&chunk.tag, b"tEst");
        assert_eq!(chunk.children, b"hello");
        assert_eq!(chunk.total_len, 17);
    }

    #[test]
    fn iterates_siblings_by_total_len_not_child_count() {
        let a = build_chunk(b"aaaa", vec![0u8; 12], b"x");
        let b = build_chunk(b"bbbb", vec![0u8; 12], b"yy");
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let tags: Vec<[u8; 4]> = iter_siblings(&buf, 0, buf.len()).map(|c| c.tag).collect();
        assert_eq!(tags, vec![*b"aaaa", *b"bbbb"]);
    }

    #[test]
    fn rejects_truncated_chunk() {
        let mut bytes = build_chunk(b"tEst", vec![0u8; 12], b"hello");
        bytes.truncate(10);
        assert!(matches!(read_chunk(&bytes, 0), Err(ChunkError::TruncatedChunk { .. })));
    }

    #[test]
    fn rejects_unknown_tag_in_context() {
        let bytes = build_chunk(b"weir", vec![0u8; 12], b"");
        assert!(matches!(
            read_chunk_in_context(&bytes, 0, &[*b"mhsd"]),
            Err(ChunkError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn accepts_known_tag_in_context() {
        let bytes = build_chunk(b"mhsd", vec![0u8; 12], b"");
        assert!(read_chunk_in_context(&bytes, 0, &[*b"mhsd"]).is_ok());
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        let mut header = vec![0u8; 12];
        header[4..8].copy_from_slice(&20u32.to_le_bytes());
        header[8..12].copy_from_slice(&10u32.to_le_bytes());
        let bytes = [b"tEst".as_slice(), &header[4..]].concat();
        assert!(matches!(read_chunk(&bytes, 0), Err(ChunkError::InconsistentLengths { .. })));
    }
}
