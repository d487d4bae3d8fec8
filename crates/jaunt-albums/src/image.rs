use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::service::AlbumError;

/// Quality used when re-encoding downloaded images for the cache.
pub const CACHE_JPEG_QUALITY: u8 = 85;

/// Decode downloaded bytes and re-encode them as a fixed-quality JPEG.
///
/// Bytes that do not decode as an image surface as [`AlbumError::ImageDecode`],
/// which callers can tell apart from "no data" transport failures.
pub fn recompress(bytes: &[u8]) -> Result<Vec<u8>, AlbumError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| AlbumError::ImageDecode(err.to_string()))?;

    let mut jpeg_bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut jpeg_bytes), CACHE_JPEG_QUALITY);
    decoded
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|err| AlbumError::ImageDecode(format!("re-encode failed: {err}")))?;

    debug!(
        original = bytes.len(),
        cached = jpeg_bytes.len(),
        "re-encoded image for cache"
    );

    Ok(jpeg_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_fixture() -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([200, 60, 20]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn recompress_produces_decodable_jpeg() {
        let jpeg = recompress(&png_fixture()).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 4);
        assert_eq!(
            image::guess_format(&jpeg).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = recompress(b"definitely not an image").unwrap_err();
        assert!(matches!(err, AlbumError::ImageDecode(_)));
    }
}
