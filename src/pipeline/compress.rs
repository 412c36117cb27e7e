use crate::config::{env_u64, env_usize};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub max_dimension: u32,
    pub quality: u8,
    pub max_bytes: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            max_dimension: 1920,
            quality: 80,
            max_bytes: 1024 * 1024,
        }
    }
}

impl CompressionPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_dimension: env_u64("COMPRESS_MAX_DIMENSION", defaults.max_dimension as u64)
                .min(u32::MAX as u64) as u32,
            quality: env_u64("COMPRESS_QUALITY", defaults.quality as u64).clamp(1, 100) as u8,
            max_bytes: env_usize("COMPRESS_MAX_BYTES", defaults.max_bytes),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("photo is empty")]
    Empty,
    #[error("could not decode photo: {0}")]
    Decode(String),
    #[error("could not encode photo: {0}")]
    Encode(String),
    #[error("compression task failed: {0}")]
    Join(String),
}

pub fn needs_compression(width: u32, height: u32, byte_len: usize, policy: &CompressionPolicy) -> bool {
    width.max(height) > policy.max_dimension || byte_len > policy.max_bytes
}

/// Returns a transfer-ready payload. Small photos come back untouched (same
/// allocation); everything else is bounded to `max_dimension` on the longest
/// edge and re-encoded as JPEG.
pub fn compress(bytes: Arc<[u8]>, policy: &CompressionPolicy) -> Result<Arc<[u8]>, CompressError> {
    if bytes.is_empty() {
        return Err(CompressError::Empty);
    }
    let decoded =
        image::load_from_memory(&bytes).map_err(|err| CompressError::Decode(err.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    if !needs_compression(width, height, bytes.len(), policy) {
        return Ok(bytes);
    }

    let bounded = if width.max(height) > policy.max_dimension {
        decoded.resize(policy.max_dimension, policy.max_dimension, FilterType::Lanczos3)
    } else {
        decoded
    };
    let rgb = bounded.to_rgb8();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let encoder = JpegEncoder::new_with_quality(&mut out, policy.quality);
    rgb.write_with_encoder(encoder)
        .map_err(|err| CompressError::Encode(err.to_string()))?;
    Ok(Arc::from(out))
}

/// `compress` on the blocking pool; decoding large photos would otherwise
/// stall the runtime.
pub async fn compress_blocking(
    bytes: Arc<[u8]>,
    policy: CompressionPolicy,
) -> Result<Arc<[u8]>, CompressError> {
    tokio::task::spawn_blocking(move || compress(bytes, &policy))
        .await
        .map_err(|err| CompressError::Join(err.to_string()))?
}
