pub mod gemini;
#[cfg(test)]
pub mod scripted;

pub use gemini::{GeminiClient, GeminiConfig};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing GEMINI_API_KEY")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Image bytes handed to the vision path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

impl ImageBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes);
        Self { bytes, mime_type }
    }

    /// Accepts raw base64 or a `data:<mime>;base64,` URL.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded,
        };
        let bytes = BASE64.decode(payload.trim())?;
        Ok(Self::new(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

/// A generative model reachable over a text path and a vision path.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError>;

    async fn generate_vision(&self, prompt: &str, images: &[ImageBlob])
    -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_sniffing_covers_common_formats() {
        assert_eq!(ImageBlob::new(vec![0x89, b'P', b'N', b'G', 0x0D]).mime_type, "image/png");
        assert_eq!(ImageBlob::new(vec![0xFF, 0xD8, 0xFF, 0xDB]).mime_type, "image/jpeg");
        assert_eq!(ImageBlob::new(b"GIF89a".to_vec()).mime_type, "image/gif");
        assert_eq!(ImageBlob::new(b"RIFF\0\0\0\0WEBPVP8 ".to_vec()).mime_type, "image/webp");
        assert_eq!(ImageBlob::new(b"mock_image_data".to_vec()).mime_type, "image/jpeg");
    }

    #[test]
    fn base64_accepts_data_urls() {
        let blob = ImageBlob::from_base64("data:image/png;base64,iVBORw0K").expect("decode");
        assert_eq!(blob.mime_type, "image/png");
        let plain = ImageBlob::from_base64(&blob.to_base64()).expect("decode");
        assert_eq!(plain, blob);
        assert!(ImageBlob::from_base64("not base64!!").is_err());
    }
}
