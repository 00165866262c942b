use crate::config::SessionConfig;
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use bytes::Bytes;
use image::{GenericImageView, ImageFormat, ImageReader, Limits, RgbImage};
use std::io::Cursor;
use thiserror::Error;

const DATA_URL_MARKER: &str = ";base64,";

/// Standard alphabet, padding optional.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("unrecognized image data: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read image header: {0}")]
    Header(#[from] std::io::Error),
    #[error("frame decoding was interrupted")]
    Interrupted,
}

/// A validated frame: the decoded RGB pixels plus the encoded bytes they came from.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub format: ImageFormat,
    pub encoded: Bytes,
    pub pixels: RgbImage,
}

impl RawImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
    max_image_dimension: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize, max_image_dimension: u32) -> Self {
        Self {
            max_frame_bytes,
            max_image_dimension,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_frame_bytes, config.max_image_dimension)
    }

    /// Turns the text carried on the wire into frame bytes. Accepts plain
    /// base64 or a `data:<mime>;base64,` URL.
    pub fn decode_payload(&self, encoded: &str) -> Result<Bytes, DecodeError> {
        let encoded = match encoded.strip_prefix("data:") {
            Some(rest) => rest
                .find(DATA_URL_MARKER)
                .map(|at| &rest[at + DATA_URL_MARKER.len()..])
                .unwrap_or(rest),
            None => encoded,
        };
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(DecodeError::Empty);
        }

        // Reject before allocating the decoded buffer.
        let estimated = encoded.len() / 4 * 3;
        if estimated > self.max_frame_bytes {
            return Err(DecodeError::TooLarge {
                size: estimated,
                limit: self.max_frame_bytes,
            });
        }

        let payload = PAYLOAD_ENGINE.decode(encoded)?;
        self.check_size(payload.len())?;
        Ok(Bytes::from(payload))
    }

    /// Decodes and validates an encoded image.
    pub fn decode(&self, payload: Bytes) -> Result<RawImage, DecodeError> {
        self.check_size(payload.len())?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_image_dimension);
        limits.max_image_height = Some(self.max_image_dimension);

        let mut reader = ImageReader::new(Cursor::new(&payload[..])).with_guessed_format()?;
        let format = reader.format().ok_or(DecodeError::UnknownFormat)?;
        reader.limits(limits);

        let decoded = reader.decode()?;
        let (width, height) = decoded.dimensions();
        tracing::trace!(?format, width, height, "Decoded frame");

        Ok(RawImage {
            format,
            encoded: payload,
            pixels: decoded.to_rgb8(),
        })
    }

    fn check_size(&self, size: usize) -> Result<(), DecodeError> {
        if size == 0 {
            return Err(DecodeError::Empty);
        }
        if size > self.max_frame_bytes {
            return Err(DecodeError::TooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    pub(crate) fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb([255, 0, 0]));
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();
        image_data
    }

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(1024 * 1024, 256)
    }

    #[test]
    fn test_decode_png() {
        let raw = decoder().decode(Bytes::from(tiny_png(4, 3))).unwrap();

        assert_eq!(raw.format, ImageFormat::Png);
        assert_eq!(raw.width(), 4);
        assert_eq!(raw.height(), 3);
        assert_eq!(raw.pixels.get_pixel(0, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(matches!(
            decoder().decode(Bytes::new()),
            Err(DecodeError::Empty)
        ));
        assert!(decoder()
            .decode(Bytes::from_static(b"definitely not an image"))
            .is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_dimensions() {
        let result = decoder().decode(Bytes::from(tiny_png(300, 2)));
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_payload_accepts_padded_unpadded_and_data_urls() {
        let png = tiny_png(2, 2);
        let padded = base64::engine::general_purpose::STANDARD.encode(&png);
        let unpadded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(&png);
        let data_url = format!("data:image/png;base64,{}", padded);

        for text in [&padded, &unpadded, &data_url] {
            let bytes = decoder().decode_payload(text).unwrap();
            assert_eq!(bytes.as_ref(), png.as_slice());
        }
    }

    #[test]
    fn test_decode_payload_rejects_invalid_base64() {
        assert!(matches!(
            decoder().decode_payload("not-base64!!"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            decoder().decode_payload("   "),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_decode_payload_rejects_oversized_before_decoding() {
        let decoder = FrameDecoder::new(16, 256);
        let text = "A".repeat(64);

        match decoder.decode_payload(&text) {
            Err(DecodeError::TooLarge { size, limit }) => {
                assert_eq!(size, 48);
                assert_eq!(limit, 16);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }
}
