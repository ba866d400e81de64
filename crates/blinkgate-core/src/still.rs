//! JPEG encoding of the enrollment still.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use thiserror::Error;

use crate::ports::Frame;

#[derive(Error, Debug)]
pub enum StillError {
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error("frame buffer is {got} bytes, expected {expected} for {width}x{height} RGB8")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Encode `frame` as JPEG at `quality` (1-100).
///
/// With `mirror` set the image is flipped horizontally, matching the selfie
/// preview the subject saw while enrolling.
pub fn encode_still(frame: &Frame, quality: u8, mirror: bool) -> Result<Vec<u8>, StillError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(StillError::EmptyFrame);
    }
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(StillError::BufferSize {
            width: frame.width,
            height: frame.height,
            expected,
            got: frame.data.len(),
        });
    }

    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or(
        StillError::BufferSize {
            width: frame.width,
            height: frame.height,
            expected,
            got: frame.data.len(),
        },
    )?;
    let image = if mirror {
        imageops::flip_horizontal(&image)
    } else {
        image
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(&image)?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(width: u32, height: u32) -> Frame {
        let data = (0..width * height)
            .flat_map(|i| {
                let v = (i * 7 % 256) as u8;
                [v, 255 - v, 128]
            })
            .collect();
        Frame {
            width,
            height,
            data,
            timestamp: Duration::ZERO,
        }
    }

    #[test]
    fn test_encodes_jpeg() {
        let jpeg = encode_still(&frame(16, 12), 95, true).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_decodes_to_same_dimensions() {
        let jpeg = encode_still(&frame(20, 10), 90, false).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 20);
        assert_eq!(decoded.height(), 10);
    }

    #[test]
    fn test_rejects_short_buffer() {
        let mut f = frame(8, 8);
        f.data.truncate(10);
        let err = encode_still(&f, 95, true).unwrap_err();
        assert!(matches!(err, StillError::BufferSize { got: 10, .. }));
    }

    #[test]
    fn test_rejects_empty_frame() {
        let f = Frame {
            width: 0,
            height: 4,
            data: vec![],
            timestamp: Duration::ZERO,
        };
        assert!(matches!(encode_still(&f, 95, true), Err(StillError::EmptyFrame)));
    }
}
