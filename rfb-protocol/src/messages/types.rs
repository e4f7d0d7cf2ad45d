//! Core wire types shared by the cache protocol messages.
//!
//! This module defines:
//! - [`Rectangle`] - Rectangle header with encoding type
//! - [`FramebufferUpdateHeader`] - the framing around a batch of rectangles
//! - Encoding and message-type constants for the cache protocol extensions

use crate::io::{RfbInStream, RfbOutStream};
use rfb_common::Rect;
use tokio::io::{AsyncRead, AsyncWrite};

/// Rectangle header for framebuffer updates.
///
/// # Wire Format
///
/// Rectangle header is 12 bytes:
/// - 2 bytes: x position
/// - 2 bytes: y position
/// - 2 bytes: width
/// - 2 bytes: height
/// - 4 bytes: encoding type (signed i32)
///
/// The struct only contains the header. The encoding-specific body follows
/// and is parsed by the decoder for that encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl Rectangle {
    /// Build a rectangle header from geometry and an encoding.
    pub fn new(rect: Rect, encoding: i32) -> Self {
        Self {
            x: rect.x as u16,
            y: rect.y as u16,
            width: rect.width as u16,
            height: rect.height as u16,
            encoding,
        }
    }

    /// Geometry of this rectangle as a [`Rect`].
    pub fn bounds(&self) -> Rect {
        Rect::new(
            self.x as i32,
            self.y as i32,
            self.width as u32,
            self.height as u32,
        )
    }

    /// Covered area in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Read a Rectangle header from an RFB input stream.
    ///
    /// This only reads the 12-byte header; the encoding-specific body that
    /// follows must be handled separately.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            x: stream.read_u16().await?,
            y: stream.read_u16().await?,
            width: stream.read_u16().await?,
            height: stream.read_u16().await?,
            encoding: stream.read_i32().await?,
        })
    }

    /// Write a Rectangle header to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u16(self.x);
        stream.write_u16(self.y);
        stream.write_u16(self.width);
        stream.write_u16(self.height);
        stream.write_i32(self.encoding);
    }
}

/// FramebufferUpdate framing: message type 0, padding, rectangle count.
///
/// # Wire Format
///
/// - 1 byte: message type (0)
/// - 1 byte: padding
/// - 2 bytes: number of rectangles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferUpdateHeader {
    pub rect_count: u16,
}

impl FramebufferUpdateHeader {
    /// Read the header body (after the message-type byte has been consumed).
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        stream.skip(1).await?; // padding
        let rect_count = stream.read_u16().await?;
        Ok(Self { rect_count })
    }

    /// Write the full header including the message-type byte.
    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u8(MSG_TYPE_FRAMEBUFFER_UPDATE);
        stream.write_u8(0); // padding
        stream.write_u16(self.rect_count);
    }
}

//
// Server-to-client message types
//

/// FramebufferUpdate message type.
pub const MSG_TYPE_FRAMEBUFFER_UPDATE: u8 = 0;

//
// Encoding type constants
//

/// Raw encoding - uncompressed pixel data.
pub const ENCODING_RAW: i32 = 0;

/// Pseudo-encoding: last rectangle marker in a framebuffer update.
pub const ENCODING_LAST_RECT: i32 = -224;

//
// Cache rectangle encodings (bodies defined in [`super::cache`])
//

/// CachedRect: session-scoped reference by 64-bit content id.
pub const ENCODING_CACHED_RECT: i32 = 100;

/// CachedRectInit: content id + inner encoding + payload.
pub const ENCODING_CACHED_RECT_INIT: i32 = 101;

/// PersistentCachedRect: reference by 16-byte CacheKey.
pub const ENCODING_PERSISTENT_CACHED_RECT: i32 = 102;

/// PersistentCachedRectInit: CacheKey + inner encoding + payload.
pub const ENCODING_PERSISTENT_CACHED_RECT_INIT: i32 = 103;

/// CachedRectSeed: tells the viewer to cache the pixels it just decoded
/// for this rectangle under the given CacheKey.
pub const ENCODING_CACHED_RECT_SEED: i32 = 104;

//
// Pseudo-encodings (for capability negotiation via SetEncodings)
//

/// Pseudo-encoding advertising session-scoped ContentCache support.
pub const PSEUDO_ENCODING_CONTENT_CACHE: i32 = -320;

/// Pseudo-encoding advertising cross-session PersistentCache support.
pub const PSEUDO_ENCODING_PERSISTENT_CACHE: i32 = -321;

//
// Client-to-server cache message types
//

/// PersistentCacheHashReport: (canonical, actual) lossy mapping report.
pub const MSG_TYPE_PERSISTENT_CACHE_HASH_REPORT: u8 = 247;

/// PersistentHashList: bulk advertisement of held content ids.
pub const MSG_TYPE_PERSISTENT_HASH_LIST: u8 = 248;

/// CacheEviction: session-scoped eviction notification (content ids).
pub const MSG_TYPE_CACHE_EVICTION: u8 = 250;

/// PersistentCacheEviction: eviction notification (CacheKeys).
pub const MSG_TYPE_PERSISTENT_CACHE_EVICTION: u8 = 251;

/// PersistentCacheQuery: request inits for missing CacheKeys.
pub const MSG_TYPE_PERSISTENT_CACHE_QUERY: u8 = 252;

/// RequestCachedData: request the init for one missing content id.
pub const MSG_TYPE_REQUEST_CACHED_DATA: u8 = 253;

/// True for the rectangle encodings belonging to the cache protocols.
pub fn is_cache_encoding(encoding: i32) -> bool {
    (ENCODING_CACHED_RECT..=ENCODING_CACHED_RECT_SEED).contains(&encoding)
}
