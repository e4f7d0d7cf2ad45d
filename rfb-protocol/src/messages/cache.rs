//! Cache protocol message types.
//!
//! The cache protocols replace re-encoded pixel data with short references,
//! keyed by the content of the pixels. Two flavours share this codec:
//!
//! - **ContentCache** (session-scoped): rectangles carry a 64-bit content id.
//! - **PersistentCache** (cross-session): rectangles carry the full 16-byte
//!   [`CacheKey`].
//!
//! # Protocol Flow
//!
//! 1. **First occurrence**: server sends [`CachedRectInit`] /
//!    [`PersistentCachedRectInit`] with the identity, the inner encoding, and
//!    the encoded pixels. The client decodes and stores the result.
//! 2. **Repeat occurrence**: server sends [`CachedRect`] /
//!    [`PersistentCachedRect`] naming only the identity; the client blits
//!    from its cache.
//! 3. **Seeding**: after a normally encoded rectangle the server may send
//!    [`CachedRectSeed`]; the client snapshots the pixels it just produced
//!    and caches them under the given key.
//! 4. **Back-channel**: the client reports evictions, cache misses
//!    (queries), lossy hash mappings, and - on reconnect - a bulk hash list.
//!
//! All integers are big-endian. Count fields are validated on read; an
//! oversized count is a protocol error and the connection must be closed.
//! Batches are chunked by the senders so no message exceeds ~64 KiB.

use crate::io::{RfbInStream, RfbOutStream};
use crate::messages::types::{
    is_cache_encoding, MSG_TYPE_CACHE_EVICTION, MSG_TYPE_PERSISTENT_CACHE_EVICTION,
    MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT, MSG_TYPE_PERSISTENT_CACHE_QUERY,
    MSG_TYPE_PERSISTENT_HASH_LIST, MSG_TYPE_REQUEST_CACHED_DATA,
};
use rfb_common::CacheKey;
use tokio::io::{AsyncRead, AsyncWrite};

/// Senders chunk eviction batches at this many keys per message.
pub const EVICTION_CHUNK: usize = 100;

/// Senders chunk hash-list advertisements at this many ids per chunk.
pub const HASH_LIST_CHUNK: usize = 2048;

/// Upper bound accepted for id-list counts (keeps bodies under ~64 KiB).
pub const MAX_ID_COUNT: usize = 8192;

/// Upper bound accepted for key-list counts (keeps bodies under ~64 KiB).
pub const MAX_KEY_COUNT: usize = 4096;

fn protocol_error(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

// ---------------------------------------------------------------------------
// Rectangle bodies (within FramebufferUpdate)
// ---------------------------------------------------------------------------

/// CachedRect - session-scoped reference to already-cached content.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 8 bytes: content id (u64)
///
/// A reference with `width=0, height=0, content_id=0` means "clear the whole
/// session cache"; a zero id with a non-empty rectangle is invalid and is
/// rejected by the decode orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRect {
    pub content_id: u64,
}

impl CachedRect {
    pub fn new(content_id: u64) -> Self {
        Self { content_id }
    }

    /// Read the body from an RFB input stream (rect header already consumed).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            content_id: stream.read_u64().await?,
        })
    }

    /// Write the body to an RFB output stream (rect header written separately).
    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u64(self.content_id);
    }
}

/// CachedRectInit - session-scoped initial transmission.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 8 bytes: content id (u64, non-zero)
/// - 4 bytes: inner encoding (i32, must not be a cache encoding)
/// - N bytes: the inner encoding's payload (read by that decoder)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectInit {
    pub content_id: u64,
    pub inner_encoding: i32,
}

impl CachedRectInit {
    pub fn new(content_id: u64, inner_encoding: i32) -> Self {
        debug_assert_ne!(content_id, 0, "content id must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            content_id,
            inner_encoding,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let content_id = stream.read_u64().await?;
        let inner_encoding = stream.read_i32().await?;

        if content_id == 0 {
            return Err(protocol_error(
                "CachedRectInit content id must be non-zero".into(),
            ));
        }
        if is_cache_encoding(inner_encoding) {
            return Err(protocol_error(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {inner_encoding}"
            )));
        }

        Ok(Self {
            content_id,
            inner_encoding,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.content_id == 0 {
            return Err(protocol_error(
                "CachedRectInit content id must be non-zero".into(),
            ));
        }
        if is_cache_encoding(self.inner_encoding) {
            return Err(protocol_error(format!(
                "CachedRectInit inner encoding cannot be a cache encoding, got {}",
                self.inner_encoding
            )));
        }
        stream.write_u64(self.content_id);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}

/// PersistentCachedRect - reference by full 16-byte CacheKey.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 16 bytes: CacheKey
///
/// The all-zero key with an empty rectangle is the "clear all" sentinel,
/// mirroring [`CachedRect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentCachedRect {
    pub key: CacheKey,
}

impl PersistentCachedRect {
    pub fn new(key: CacheKey) -> Self {
        Self { key }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            key: stream.read_cache_key().await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_cache_key(&self.key);
    }
}

/// PersistentCachedRectInit - initial transmission keyed by CacheKey.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 16 bytes: CacheKey (non-zero)
/// - 4 bytes: inner encoding (i32, must not be a cache encoding)
/// - N bytes: the inner encoding's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentCachedRectInit {
    pub key: CacheKey,
    pub inner_encoding: i32,
}

impl PersistentCachedRectInit {
    pub fn new(key: CacheKey, inner_encoding: i32) -> Self {
        debug_assert!(!key.is_zero(), "cache key must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            key,
            inner_encoding,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let key = stream.read_cache_key().await?;
        let inner_encoding = stream.read_i32().await?;

        if key.is_zero() {
            return Err(protocol_error(
                "PersistentCachedRectInit key must be non-zero".into(),
            ));
        }
        if is_cache_encoding(inner_encoding) {
            return Err(protocol_error(format!(
                "PersistentCachedRectInit inner encoding cannot be a cache encoding, got {inner_encoding}"
            )));
        }

        Ok(Self {
            key,
            inner_encoding,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.key.is_zero() {
            return Err(protocol_error(
                "PersistentCachedRectInit key must be non-zero".into(),
            ));
        }
        if is_cache_encoding(self.inner_encoding) {
            return Err(protocol_error(format!(
                "PersistentCachedRectInit inner encoding cannot be a cache encoding, got {}",
                self.inner_encoding
            )));
        }
        stream.write_cache_key(&self.key);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}

/// CachedRectSeed - cache the pixels already produced for this rectangle.
///
/// Sent after the rectangle's pixels were transmitted with a normal
/// encoding. The viewer snapshots its decoded framebuffer content for the
/// rectangle and stores it under `key`.
///
/// # Wire Format (after the 12-byte rectangle header)
///
/// - 16 bytes: CacheKey (non-zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectSeed {
    pub key: CacheKey,
}

impl CachedRectSeed {
    pub fn new(key: CacheKey) -> Self {
        debug_assert!(!key.is_zero(), "seed key must be non-zero");
        Self { key }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let key = stream.read_cache_key().await?;
        if key.is_zero() {
            return Err(protocol_error("CachedRectSeed key must be non-zero".into()));
        }
        Ok(Self { key })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_cache_key(&self.key);
    }
}

// ---------------------------------------------------------------------------
// Client-to-server messages
// ---------------------------------------------------------------------------

/// RequestCachedData - request the init for one missing content id.
///
/// # Wire Format
///
/// - 1 byte: message type (253)
/// - 8 bytes: content id (u64)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCachedData {
    pub content_id: u64,
}

impl RequestCachedData {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            content_id: stream.read_u64().await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(MSG_TYPE_REQUEST_CACHED_DATA);
        stream.write_u64(self.content_id);
    }
}

/// CacheEviction - session-scoped eviction notification.
///
/// # Wire Format
///
/// - 1 byte: message type (250)
/// - 1 byte: padding
/// - 2 bytes: count
/// - count x 8 bytes: content ids
///
/// A count of 0 is a legal no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEviction {
    pub content_ids: Vec<u64>,
}

impl CacheEviction {
    /// Split a batch of ids into chunked messages of [`EVICTION_CHUNK`].
    pub fn chunked(ids: &[u64]) -> Vec<Self> {
        ids.chunks(EVICTION_CHUNK)
            .map(|chunk| Self {
                content_ids: chunk.to_vec(),
            })
            .collect()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let count = stream.read_u16().await? as usize;
        if count > MAX_ID_COUNT {
            return Err(protocol_error(format!(
                "CacheEviction count {count} exceeds maximum {MAX_ID_COUNT}"
            )));
        }
        let mut content_ids = Vec::with_capacity(count);
        for _ in 0..count {
            content_ids.push(stream.read_u64().await?);
        }
        Ok(Self { content_ids })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.content_ids.len() > MAX_ID_COUNT {
            return Err(protocol_error(format!(
                "CacheEviction count {} exceeds maximum {MAX_ID_COUNT}",
                self.content_ids.len()
            )));
        }
        stream.write_u8(MSG_TYPE_CACHE_EVICTION);
        stream.write_u8(0); // padding
        stream.write_u16(self.content_ids.len() as u16);
        for id in &self.content_ids {
            stream.write_u64(*id);
        }
        Ok(())
    }
}

/// PersistentCacheEviction - eviction notification carrying full keys.
///
/// # Wire Format
///
/// - 1 byte: message type (251)
/// - 1 byte: padding
/// - 2 bytes: count
/// - count x 16 bytes: CacheKeys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheEviction {
    pub keys: Vec<CacheKey>,
}

impl PersistentCacheEviction {
    /// Split a batch of keys into chunked messages of [`EVICTION_CHUNK`].
    pub fn chunked(keys: &[CacheKey]) -> Vec<Self> {
        keys.chunks(EVICTION_CHUNK)
            .map(|chunk| Self {
                keys: chunk.to_vec(),
            })
            .collect()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let count = stream.read_u16().await? as usize;
        if count > MAX_KEY_COUNT {
            return Err(protocol_error(format!(
                "PersistentCacheEviction count {count} exceeds maximum {MAX_KEY_COUNT}"
            )));
        }
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(stream.read_cache_key().await?);
        }
        Ok(Self { keys })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.keys.len() > MAX_KEY_COUNT {
            return Err(protocol_error(format!(
                "PersistentCacheEviction count {} exceeds maximum {MAX_KEY_COUNT}",
                self.keys.len()
            )));
        }
        stream.write_u8(MSG_TYPE_PERSISTENT_CACHE_EVICTION);
        stream.write_u8(0); // padding
        stream.write_u16(self.keys.len() as u16);
        for key in &self.keys {
            stream.write_cache_key(key);
        }
        Ok(())
    }
}

/// PersistentCacheQuery - request inits for missing keys.
///
/// Sent when a reference arrives for content the viewer no longer holds.
/// The server answers each key with an init (or ignores unknown keys).
///
/// # Wire Format
///
/// - 1 byte: message type (252)
/// - 1 byte: padding
/// - 2 bytes: count
/// - count x 16 bytes: CacheKeys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheQuery {
    pub keys: Vec<CacheKey>,
}

impl PersistentCacheQuery {
    /// Split a batch of keys into chunked messages of [`EVICTION_CHUNK`].
    pub fn chunked(keys: &[CacheKey]) -> Vec<Self> {
        keys.chunks(EVICTION_CHUNK)
            .map(|chunk| Self {
                keys: chunk.to_vec(),
            })
            .collect()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let count = stream.read_u16().await? as usize;
        if count > MAX_KEY_COUNT {
            return Err(protocol_error(format!(
                "PersistentCacheQuery count {count} exceeds maximum {MAX_KEY_COUNT}"
            )));
        }
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(stream.read_cache_key().await?);
        }
        Ok(Self { keys })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.keys.len() > MAX_KEY_COUNT {
            return Err(protocol_error(format!(
                "PersistentCacheQuery count {} exceeds maximum {MAX_KEY_COUNT}",
                self.keys.len()
            )));
        }
        stream.write_u8(MSG_TYPE_PERSISTENT_CACHE_QUERY);
        stream.write_u8(0); // padding
        stream.write_u16(self.keys.len() as u16);
        for key in &self.keys {
            stream.write_cache_key(key);
        }
        Ok(())
    }
}

/// PersistentHashList - bulk advertisement of held content ids.
///
/// Sent by a freshly reconnected client so the server can seed its known-key
/// set without re-transmitting content. A logical list is split into chunks
/// sharing a `sequence_id`; the server reassembles by
/// (`total_chunks`, `chunk_index`).
///
/// # Wire Format
///
/// - 1 byte: message type (248)
/// - 4 bytes: sequence id
/// - 2 bytes: total chunks (>= 1)
/// - 2 bytes: chunk index (< total chunks)
/// - 2 bytes: count
/// - count x 8 bytes: content ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentHashList {
    pub sequence_id: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub content_ids: Vec<u64>,
}

impl PersistentHashList {
    /// Split a full id list into wire chunks of [`HASH_LIST_CHUNK`].
    pub fn chunked(sequence_id: u32, ids: &[u64]) -> Vec<Self> {
        if ids.is_empty() {
            return vec![Self {
                sequence_id,
                total_chunks: 1,
                chunk_index: 0,
                content_ids: Vec::new(),
            }];
        }
        let total = ids.len().div_ceil(HASH_LIST_CHUNK);
        ids.chunks(HASH_LIST_CHUNK)
            .enumerate()
            .map(|(i, chunk)| Self {
                sequence_id,
                total_chunks: total as u16,
                chunk_index: i as u16,
                content_ids: chunk.to_vec(),
            })
            .collect()
    }

    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let sequence_id = stream.read_u32().await?;
        let total_chunks = stream.read_u16().await?;
        let chunk_index = stream.read_u16().await?;
        let count = stream.read_u16().await? as usize;

        if total_chunks == 0 {
            return Err(protocol_error(
                "PersistentHashList total chunks must be >= 1".into(),
            ));
        }
        if chunk_index >= total_chunks {
            return Err(protocol_error(format!(
                "PersistentHashList chunk index {chunk_index} out of range (total {total_chunks})"
            )));
        }
        if count > MAX_ID_COUNT {
            return Err(protocol_error(format!(
                "PersistentHashList count {count} exceeds maximum {MAX_ID_COUNT}"
            )));
        }

        let mut content_ids = Vec::with_capacity(count);
        for _ in 0..count {
            content_ids.push(stream.read_u64().await?);
        }
        Ok(Self {
            sequence_id,
            total_chunks,
            chunk_index,
            content_ids,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(protocol_error(format!(
                "PersistentHashList chunk index {} out of range (total {})",
                self.chunk_index, self.total_chunks
            )));
        }
        if self.content_ids.len() > MAX_ID_COUNT {
            return Err(protocol_error(format!(
                "PersistentHashList count {} exceeds maximum {MAX_ID_COUNT}",
                self.content_ids.len()
            )));
        }
        stream.write_u8(MSG_TYPE_PERSISTENT_HASH_LIST);
        stream.write_u32(self.sequence_id);
        stream.write_u16(self.total_chunks);
        stream.write_u16(self.chunk_index);
        stream.write_u16(self.content_ids.len() as u16);
        for id in &self.content_ids {
            stream.write_u64(*id);
        }
        Ok(())
    }
}

/// PersistentCacheHashReport - lossy (canonical, actual) mapping report.
///
/// Emitted when a lossy decode produced pixels whose hash differs from the
/// server's canonical hash. Lets the server answer later occurrences of the
/// canonical content with a plain reference.
///
/// # Wire Format
///
/// - 1 byte: message type (247)
/// - 16 bytes: canonical CacheKey
/// - 16 bytes: actual CacheKey
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentCacheHashReport {
    pub canonical: CacheKey,
    pub actual: CacheKey,
}

impl PersistentCacheHashReport {
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            canonical: stream.read_cache_key().await?,
            actual: stream.read_cache_key().await?,
        })
    }

    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT);
        stream.write_cache_key(&self.canonical);
        stream.write_cache_key(&self.actual);
    }
}

/// Tagged union of the client-to-server cache messages.
///
/// The server's per-connection read loop dispatches on the message-type
/// byte and hands the parsed variant to the client tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCacheMessage {
    RequestCachedData(RequestCachedData),
    CacheEviction(CacheEviction),
    PersistentCacheEviction(PersistentCacheEviction),
    PersistentCacheQuery(PersistentCacheQuery),
    PersistentHashList(PersistentHashList),
    HashReport(PersistentCacheHashReport),
}

impl ClientCacheMessage {
    /// True if `msg_type` belongs to the cache protocol.
    pub fn handles(msg_type: u8) -> bool {
        matches!(
            msg_type,
            MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT
                | MSG_TYPE_PERSISTENT_HASH_LIST
                | MSG_TYPE_CACHE_EVICTION
                | MSG_TYPE_PERSISTENT_CACHE_EVICTION
                | MSG_TYPE_PERSISTENT_CACHE_QUERY
                | MSG_TYPE_REQUEST_CACHED_DATA
        )
    }

    /// Parse the body for a previously read message-type byte.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown message types or malformed
    /// bodies; callers must close the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(
        msg_type: u8,
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        match msg_type {
            MSG_TYPE_REQUEST_CACHED_DATA => Ok(Self::RequestCachedData(
                RequestCachedData::read_from(stream).await?,
            )),
            MSG_TYPE_CACHE_EVICTION => {
                Ok(Self::CacheEviction(CacheEviction::read_from(stream).await?))
            }
            MSG_TYPE_PERSISTENT_CACHE_EVICTION => Ok(Self::PersistentCacheEviction(
                PersistentCacheEviction::read_from(stream).await?,
            )),
            MSG_TYPE_PERSISTENT_CACHE_QUERY => Ok(Self::PersistentCacheQuery(
                PersistentCacheQuery::read_from(stream).await?,
            )),
            MSG_TYPE_PERSISTENT_HASH_LIST => Ok(Self::PersistentHashList(
                PersistentHashList::read_from(stream).await?,
            )),
            MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT => Ok(Self::HashReport(
                PersistentCacheHashReport::read_from(stream).await?,
            )),
            other => Err(protocol_error(format!(
                "unknown cache message type {other}"
            ))),
        }
    }

    /// Serialise this message including its message-type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        match self {
            Self::RequestCachedData(m) => {
                m.write_to(stream);
                Ok(())
            }
            Self::CacheEviction(m) => m.write_to(stream),
            Self::PersistentCacheEviction(m) => m.write_to(stream),
            Self::PersistentCacheQuery(m) => m.write_to(stream),
            Self::PersistentHashList(m) => m.write_to(stream),
            Self::HashReport(m) => {
                m.write_to(stream);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{ENCODING_CACHED_RECT, ENCODING_RAW};
    use std::io::Cursor;

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 16])
    }

    #[tokio::test]
    async fn test_cached_rect_round_trip() {
        let original = CachedRect::new(12345);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 8);

        let mut input = RfbInStream::new(Cursor::new(buffer));
        let read_back = CachedRect::read_from(&mut input).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_cached_rect_zero_id_is_clear_all_sentinel() {
        // Zero is representable; interpretation is up to the orchestrator.
        let data = vec![0u8; 8];
        let mut input = RfbInStream::new(Cursor::new(data));
        let parsed = CachedRect::read_from(&mut input).await.unwrap();
        assert_eq!(parsed.content_id, 0);
    }

    #[tokio::test]
    async fn test_cached_rect_init_round_trip() {
        let original = CachedRectInit::new(67890, ENCODING_RAW);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 12); // 8 + 4

        let mut input = RfbInStream::new(Cursor::new(buffer));
        let read_back = CachedRectInit::read_from(&mut input).await.unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_cached_rect_init_zero_id_rejected() {
        let mut data = vec![0u8; 12];
        data[8..12].copy_from_slice(&ENCODING_RAW.to_be_bytes());
        let mut input = RfbInStream::new(Cursor::new(data));
        let result = CachedRectInit::read_from(&mut input).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("non-zero"));
    }

    #[tokio::test]
    async fn test_cached_rect_init_recursive_encoding_rejected() {
        let mut data = vec![0u8; 12];
        data[0..8].copy_from_slice(&12345u64.to_be_bytes());
        data[8..12].copy_from_slice(&ENCODING_CACHED_RECT.to_be_bytes());

        let mut input = RfbInStream::new(Cursor::new(data));
        let result = CachedRectInit::read_from(&mut input).await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot be a cache encoding"));
    }

    #[tokio::test]
    async fn test_persistent_init_and_seed_round_trip() {
        let init = PersistentCachedRectInit::new(key(0x11), ENCODING_RAW);
        let seed = CachedRectSeed::new(key(0x22));

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        init.write_to(&mut out).unwrap();
        seed.write_to(&mut out);
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 20 + 16);

        let mut input = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(
            PersistentCachedRectInit::read_from(&mut input).await.unwrap(),
            init
        );
        assert_eq!(CachedRectSeed::read_from(&mut input).await.unwrap(), seed);
    }

    #[tokio::test]
    async fn test_seed_zero_key_rejected() {
        let data = vec![0u8; 16];
        let mut input = RfbInStream::new(Cursor::new(data));
        assert!(CachedRectSeed::read_from(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_eviction_round_trip_and_empty_noop() {
        for ids in [vec![], vec![1u64, 2, 3]] {
            let original = CacheEviction {
                content_ids: ids.clone(),
            };
            let mut buffer = Vec::new();
            let mut out = RfbOutStream::new(&mut buffer);
            original.write_to(&mut out).unwrap();
            out.flush().await.unwrap();
            assert_eq!(buffer.len(), 4 + 8 * ids.len());

            let mut input = RfbInStream::new(Cursor::new(buffer));
            assert_eq!(input.read_u8().await.unwrap(), MSG_TYPE_CACHE_EVICTION);
            let read_back = CacheEviction::read_from(&mut input).await.unwrap();
            assert_eq!(original, read_back);
        }
    }

    #[tokio::test]
    async fn test_eviction_chunking() {
        let ids: Vec<u64> = (0..250).collect();
        let chunks = CacheEviction::chunked(&ids);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content_ids.len(), 100);
        assert_eq!(chunks[2].content_ids.len(), 50);
        let total: usize = chunks.iter().map(|c| c.content_ids.len()).sum();
        assert_eq!(total, 250);
    }

    #[tokio::test]
    async fn test_oversized_count_rejected() {
        // CacheEviction with count larger than MAX_ID_COUNT.
        let mut data = vec![0u8]; // padding
        data.extend_from_slice(&(u16::MAX).to_be_bytes());
        let mut input = RfbInStream::new(Cursor::new(data));
        let result = CacheEviction::read_from(&mut input).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_persistent_eviction_and_query_round_trip() {
        let eviction = PersistentCacheEviction {
            keys: vec![key(1), key(2)],
        };
        let query = PersistentCacheQuery {
            keys: vec![key(3)],
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        eviction.write_to(&mut out).unwrap();
        query.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let mut input = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(
            input.read_u8().await.unwrap(),
            MSG_TYPE_PERSISTENT_CACHE_EVICTION
        );
        assert_eq!(
            PersistentCacheEviction::read_from(&mut input).await.unwrap(),
            eviction
        );
        assert_eq!(
            input.read_u8().await.unwrap(),
            MSG_TYPE_PERSISTENT_CACHE_QUERY
        );
        assert_eq!(
            PersistentCacheQuery::read_from(&mut input).await.unwrap(),
            query
        );
    }

    #[tokio::test]
    async fn test_hash_list_chunking_and_round_trip() {
        let ids: Vec<u64> = (0..5000).collect();
        let chunks = PersistentHashList::chunked(7, &ids);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.sequence_id == 7));
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        let total: usize = chunks.iter().map(|c| c.content_ids.len()).sum();
        assert_eq!(total, 5000);

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        chunks[1].write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let mut input = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(
            input.read_u8().await.unwrap(),
            MSG_TYPE_PERSISTENT_HASH_LIST
        );
        let read_back = PersistentHashList::read_from(&mut input).await.unwrap();
        assert_eq!(chunks[1], read_back);
    }

    #[tokio::test]
    async fn test_hash_list_empty_advertisement() {
        let chunks = PersistentHashList::chunked(1, &[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_chunks, 1);
        assert!(chunks[0].content_ids.is_empty());
    }

    #[tokio::test]
    async fn test_hash_list_bad_chunk_index_rejected() {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        out.write_u32(1); // sequence
        out.write_u16(2); // total chunks
        out.write_u16(2); // chunk index == total (invalid)
        out.write_u16(0); // count
        out.flush().await.unwrap();

        let mut input = RfbInStream::new(Cursor::new(buffer));
        assert!(PersistentHashList::read_from(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_hash_report_round_trip() {
        let original = PersistentCacheHashReport {
            canonical: key(0xAA),
            actual: key(0xBB),
        };

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        original.write_to(&mut out);
        out.flush().await.unwrap();
        assert_eq!(buffer.len(), 1 + 32);

        let mut input = RfbInStream::new(Cursor::new(buffer));
        assert_eq!(
            input.read_u8().await.unwrap(),
            MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT
        );
        let read_back = PersistentCacheHashReport::read_from(&mut input)
            .await
            .unwrap();
        assert_eq!(original, read_back);
    }

    #[tokio::test]
    async fn test_client_message_dispatch() {
        let msg = ClientCacheMessage::CacheEviction(CacheEviction {
            content_ids: vec![42],
        });

        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        msg.write_to(&mut out).unwrap();
        out.flush().await.unwrap();

        let mut input = RfbInStream::new(Cursor::new(buffer));
        let msg_type = input.read_u8().await.unwrap();
        assert!(ClientCacheMessage::handles(msg_type));
        let read_back = ClientCacheMessage::read_from(msg_type, &mut input)
            .await
            .unwrap();
        assert_eq!(msg, read_back);
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_protocol_error() {
        let mut input = RfbInStream::new(Cursor::new(Vec::new()));
        assert!(!ClientCacheMessage::handles(99));
        assert!(ClientCacheMessage::read_from(99, &mut input).await.is_err());
    }
}
