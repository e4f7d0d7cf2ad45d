//! Canonical content fingerprints.
//!
//! A rectangle's identity is the first 16 bytes of a 256-bit BLAKE3 hash
//! over `(width, height, canonical pixel stream)`. Width and height are part
//! of the hashed domain, so two rectangles with equal keys always have equal
//! dimensions. Pixels are fed row-tight in the canonical 32bpp format;
//! stride padding never reaches the hasher.
//!
//! Bytes 16..20 of the same hash serve as a short collision verifier stored
//! per entry: two payloads that collide on the truncated key are told apart
//! by the verifier, at which point the newer entry wins.

use crate::error::{CacheError, Result};
use rfb_common::{CacheKey, Rect};
use rfb_pixelbuffer::PixelBuffer;

/// Digest of one rectangle: the cache key plus the collision verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectDigest {
    pub key: CacheKey,
    pub verifier: u32,
}

/// Hash a rectangle of a pixel buffer.
///
/// The pixels are converted to the canonical domain before hashing, so the
/// result is independent of the buffer's local pixel format.
///
/// # Errors
///
/// Returns [`CacheError::Uncacheable`] for zero-area rectangles and for
/// rectangles whose pixels cannot be read; callers must fall back to the
/// normal encode/decode path.
pub fn hash_rect(pb: &dyn PixelBuffer, rect: Rect) -> Result<RectDigest> {
    if rect.is_empty() {
        return Err(CacheError::Uncacheable("zero-area rectangle".into()));
    }
    let pixels = pb
        .canonical_bytes(rect)
        .map_err(|e| CacheError::Uncacheable(format!("pixel read failed: {e}")))?;
    Ok(hash_canonical_tile(rect.width, rect.height, &pixels))
}

/// Hash an already-extracted tile of tightly packed canonical pixels.
///
/// `pixels.len()` must equal `width * height * 4`.
pub fn hash_canonical_tile(width: u32, height: u32, pixels: &[u8]) -> RectDigest {
    debug_assert_eq!(
        pixels.len(),
        width as usize * height as usize * 4,
        "tile must be tightly packed canonical pixels"
    );
    let mut hasher = blake3::Hasher::new();
    hasher.update(&width.to_be_bytes());
    hasher.update(&height.to_be_bytes());
    hasher.update(pixels);
    digest_from(hasher.finalize())
}

/// Sampled variant of [`hash_rect`] for very large rectangles.
///
/// With `sample_rate > 1` only every `sample_rate`-th row is hashed (row 0
/// always included); the dimensions still enter the hash so the sampled and
/// full hashes never collide across differing geometry. A `sample_rate` of
/// 0 or 1 is the full hash.
///
/// Disabled by default: the sampled fingerprint deliberately ignores pixels
/// and must not be mixed with full hashes for the same content until a
/// collision study justifies it.
pub fn hash_rect_sampled(pb: &dyn PixelBuffer, rect: Rect, sample_rate: u32) -> Result<RectDigest> {
    if sample_rate <= 1 {
        return hash_rect(pb, rect);
    }
    if rect.is_empty() {
        return Err(CacheError::Uncacheable("zero-area rectangle".into()));
    }
    let pixels = pb
        .canonical_bytes(rect)
        .map_err(|e| CacheError::Uncacheable(format!("pixel read failed: {e}")))?;

    let row_bytes = rect.width as usize * 4;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&rect.width.to_be_bytes());
    hasher.update(&rect.height.to_be_bytes());
    hasher.update(&sample_rate.to_be_bytes());
    for y in (0..rect.height as usize).step_by(sample_rate as usize) {
        hasher.update(&pixels[y * row_bytes..(y + 1) * row_bytes]);
    }
    Ok(digest_from(hasher.finalize()))
}

fn digest_from(hash: blake3::Hash) -> RectDigest {
    let bytes = hash.as_bytes();
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes[..16]);
    let verifier = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
    RectDigest {
        key: CacheKey::from_bytes(key),
        verifier,
    }
}
