//! Content identity of a cached rectangle.
//!
//! A [`CacheKey`] is the 16-byte truncation of a 256-bit content hash
//! computed over `(width, height, canonical pixel stream)`. Because the
//! dimensions are part of the hashed domain, two rectangles with equal keys
//! always have equal dimensions.
//!
//! For the session-scoped wire messages and in-memory indexing a shorter
//! 64-bit [`content id`](CacheKey::content_id) is carried alongside: the
//! first 8 bytes of the key interpreted big-endian.

/// 16-byte content identity of a rectangle's canonical pixels.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CacheKey(pub [u8; 16]);

impl CacheKey {
    /// Number of bytes in a key.
    pub const LEN: usize = 16;

    /// The all-zero key, reserved as the "clear all" sentinel on the wire.
    pub const ZERO: CacheKey = CacheKey([0u8; 16]);

    /// Construct from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// View the key as a byte slice.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The 64-bit content id: first 8 bytes, big-endian.
    pub fn content_id(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }

    /// Reconstruct a key from a bare content id (remaining bytes zero).
    ///
    /// Session-scoped messages carry only the 64-bit id; the viewer indexes
    /// such entries under this widened form.
    pub fn from_content_id(id: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&id.to_be_bytes());
        Self(bytes)
    }

    /// True for the reserved all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

impl From<[u8; 16]> for CacheKey {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_big_endian_prefix() {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        let key = CacheKey::from_bytes(bytes);
        assert_eq!(key.content_id(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_from_content_id_round_trip() {
        let key = CacheKey::from_content_id(0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(key.content_id(), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(&key.as_bytes()[8..], &[0u8; 8]);
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(CacheKey::ZERO.is_zero());
        assert!(!CacheKey::from_content_id(1).is_zero());
    }

    #[test]
    fn test_display_hex() {
        let key = CacheKey::from_bytes([0xab; 16]);
        assert_eq!(key.to_string(), "ab".repeat(16));
    }
}
