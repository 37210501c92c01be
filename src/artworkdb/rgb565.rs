//! RGB565 little-endian pixel packing with per-format stride padding.

use super::ArtFormat;
use image::imageops::FilterType;
use image::GenericImageView;

/// Resize `img` to `format`'s dimensions and pack as RGB565-LE, padding
/// each row out to `stride_width` pixels with zeroed padding pixels.
pub fn encode(img: &image::DynamicImage, format: &ArtFormat) -> Vec<u8> {
    let resized = img.resize_exact(format.width as u32, format.height as u32, FilterType::Lanczos3);
    let mut out = Vec::with_capacity(format.stride_width as usize * format.height as usize * 2);

    for y in 0..format.height as u32 {
        for x in 0..format.width as u32 {
            let px = resized.get_pixel(x, y);
            let [r, g, b, _a] = px.0;
            let packed = pack565(r, g, b);
            out.extend_from_slice(&packed.to_le_bytes());
        }
        let pad_pixels = format.stride_width - format.width;
        out.extend(std::iter::repeat(0u8).take(pad_pixels as usize * 2));
    }
    out
}

fn pack565(r: u8, g: u8, b: u8) -> u16 {
    let r5 = (r as u16 >> 3) & 0x1F;
    let g6 = (g as u16 >> 2) & 0x3F;
    let b5 = (b as u16 >> 3) & 0x1F;
    (r5 << 11) | (g6 << 5) | b5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack565_white_is_all_ones() {
        assert_eq!(pack565(255, 255, 255), 0xFFFF);
    }

    #[test]
    fn pack565_black_is_zero() {
        assert_eq!(pack565(0, 0, 0), 0x0000);
    }

    #[test]
    fn encode_pads_stride_for_thumbnail_format() {
        let fmt = ArtFormat { id: 1061, width: 2, height: 1, stride_width: 4 };
        let img = image::DynamicImage::new_rgb8(2, 1);
        let bytes = encode(&img, &fmt);
        assert_eq!(bytes.len(), 4 * 1 * 2);
    }
}
