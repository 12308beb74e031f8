//! Image decoding

use image::DynamicImage;

use super::errors::DecodeError;

/// Turns fetched bytes into pixels
///
/// Called from a blocking thread; implementations may take as long as they
/// need but cannot be interrupted once started.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, DecodeError>;
}

/// Decoder backed by the `image` crate, guessing the format from magic bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(image::load_from_memory(bytes)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Encode a solid-colour PNG of the given size
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 40]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let img = ImageCrateDecoder.decode(&png_bytes(12, 6)).unwrap();
        assert_eq!((img.width(), img.height()), (12, 6));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(
            ImageCrateDecoder.decode(&[]),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_decode_garbage_is_unsupported() {
        let err = ImageCrateDecoder.decode(b"<html>not an image</html>").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(_)), "got {err:?}");
    }

    #[test]
    fn test_decode_truncated_png_is_malformed() {
        let bytes = png_bytes(32, 32);
        let err = ImageCrateDecoder.decode(&bytes[..40]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)), "got {err:?}");
    }
}
