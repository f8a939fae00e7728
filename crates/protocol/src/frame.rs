//! Screen frame payloads carried by `screen-data` events.
//!
//! Hosts send each frame as a still image, either as a data URL or as bare
//! base64:
//! ```text
//! data:image/jpeg;base64,/9j/4AAQSkZJRg...
//! /9j/4AAQSkZJRg...
//! ```
//! The declared MIME type is informational only; the actual format is
//! sniffed from the decoded magic bytes.

use base64::Engine;

const DATA_URL_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

/// Upper bound on a single decoded frame (a 4K PNG stays well below this).
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
    Png,
    WebP,
    Bmp,
    Gif,
}

impl FrameFormat {
    /// Identify the image format from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Png),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(Self::WebP),
            [b'B', b'M', ..] => Some(Self::Bmp),
            [b'G', b'I', b'F', b'8', ..] => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Gif => "image/gif",
        }
    }
}

/// A frame payload after base64 decoding, not yet rasterized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub format: FrameFormat,
    pub bytes: Vec<u8>,
}

impl EncodedFrame {
    /// Parse an `imageData` string (data URL or bare base64).
    pub fn parse(image_data: &str) -> Result<Self, FrameError> {
        let trimmed = image_data.trim();
        if trimmed.is_empty() {
            return Err(FrameError::Empty);
        }

        let encoded = if let Some(rest) = trimmed.strip_prefix(DATA_URL_PREFIX) {
            let (mime, payload) = rest
                .split_once(BASE64_MARKER)
                .ok_or(FrameError::NotBase64)?;
            if !mime.starts_with("image/") {
                return Err(FrameError::UnsupportedMime(mime.to_string()));
            }
            payload
        } else {
            trimmed
        };

        // Worst-case decoded size is 3/4 of the encoded length.
        if encoded.len() / 4 * 3 > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(encoded.len() / 4 * 3));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(FrameError::Base64)?;
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }

        let format = FrameFormat::sniff(&bytes).ok_or_else(|| {
            let mut magic = [0u8; 4];
            let n = bytes.len().min(4);
            magic[..n].copy_from_slice(&bytes[..n]);
            FrameError::UnknownFormat(u32::from_be_bytes(magic))
        })?;

        Ok(Self { format, bytes })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("data URL is not base64-encoded")]
    NotBase64,
    #[error("unsupported MIME type: {0}")]
    UnsupportedMime(String),
    #[error("frame too large: {0} bytes (max {MAX_FRAME_BYTES})")]
    TooLarge(usize),
    #[error("invalid base64: {0}")]
    Base64(#[source] base64::DecodeError),
    #[error("unknown image format (magic 0x{0:08x})")]
    UnknownFormat(u32),
}
