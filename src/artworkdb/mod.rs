//! ArtworkDB reader/writer: the per-format RGB565 pixel files (`F<id>_1.ithmb`)
//! plus the `MHFD` index that ties a track's `dbid` to an image entry.

pub mod reader;
pub mod rgb565;
pub mod writer;

pub use reader::{parse_artworkdb, PreservedArt};
pub use writer::write_artworkdb;

/// One artwork raster variant the iPod Classic firmware expects.
#[derive(Debug, Clone, Copy)]
pub struct ArtFormat {
    pub id: u32,
    pub width: u16,
    pub height: u16,
    /// Row stride in pixels; equals `width` except for the 55x55 thumbnail,
    /// whose rows are padded to 56 pixels.
    pub stride_width: u16,
}

pub const FORMATS: [ArtFormat; 3] = [
    ArtFormat { id: 1055, width: 128, height: 128, stride_width: 128 },
    ArtFormat { id: 1060, width: 320, height: 320, stride_width: 320 },
    ArtFormat { id: 1061, width: 55, height: 55, stride_width: 56 },
];

/// Where the pixel bytes for one image come from.
#[derive(Debug, Clone)]
pub enum ArtSource {
    /// Freshly decoded source image bytes (JPEG/PNG), to be resized and
    /// packed into every supported format.
    Fresh(Vec<u8>),
    /// Raw per-format pixel bytes recovered from the existing ArtworkDB,
    /// reused verbatim because no PC-side source matched this sync.
    Preserved(std::collections::HashMap<u32, Vec<u8>>),
}

#[derive(Debug, Clone)]
pub struct ArtworkJob {
    pub track_dbid: u64,
    /// MD5 of the original source bytes; used to dedupe identical artwork
    /// across tracks (e.g. every track on the same album).
    pub content_hash: [u8; 16],
    pub source: ArtSource,
}

/// Per-track result the iTunesDB writer consumes to populate
/// `mhii_link`/`artwork_size`/`has_artwork`/`artwork_count`.
#[derive(Debug, Clone, Copy)]
pub struct ArtworkLink {
    pub img_id: u32,
    pub src_img_size: u32,
}
