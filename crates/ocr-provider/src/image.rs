//! Image payloads sent to the OCR provider
//!
//! Inbound requests carry images as base64, either bare or as a
//! `data:image/<type>;base64,` URL. The provider expects the data URL form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Mime type assumed when the caller sends bare base64.
pub const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("invalid data URL: {0}")]
    DataUrl(String),

    #[error("invalid base64 image: {0}")]
    Base64(String),

    #[error("image is empty")]
    Empty,
}

/// Decoded image bytes plus their mime type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    /// Decode a bare base64 string or a `data:<mime>;base64,<data>` URL.
    pub fn from_base64(input: &str) -> Result<Self, ImageError> {
        let input = input.trim();
        let (mime, data) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest
                    .split_once(',')
                    .ok_or_else(|| ImageError::DataUrl("missing ',' separator".into()))?;
                let mime = header
                    .strip_suffix(";base64")
                    .ok_or_else(|| ImageError::DataUrl("only base64 data URLs are supported".into()))?;
                if !mime.starts_with("image/") {
                    return Err(ImageError::DataUrl(format!("unsupported mime type {mime:?}")));
                }
                (mime.to_string(), data)
            }
            None => (DEFAULT_MIME.to_string(), input),
        };

        let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| ImageError::Base64(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self { bytes, mime })
    }

    /// Re-encode as a data URL, the form OCR providers accept in `base64Image`.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Images can be megabytes; never dump them into logs.
impl std::fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}
