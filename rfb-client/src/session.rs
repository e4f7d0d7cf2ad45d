//! Viewer cache session: message interception and flush ordering.
//!
//! [`CacheSession`] sits between the wire codec and the decoders. The
//! protocol read loop hands it each framebuffer update; it frames every
//! rectangle, intercepts the cache envelopes, and feeds the decode worker
//! pool. At the end of each update it runs the flush sequence:
//!
//! 1. drain the decode queue
//! 2. emit pending evictions (before queries, so an eviction of `k` always
//!    reaches the server ahead of any query racing with a re-send of `k`)
//! 3. emit pending queries
//! 4. emit pending lossy hash reports
//! 5. hydrate one batch of cold entries from disk
//! 6. periodically persist the dirty index

use crate::config::ViewerConfig;
use crate::decode::{
    track_reference, CacheRef, DecodePool, InFlightTable, WorkKind, WorkerContext,
};
use crate::errors::RfbClientError;
use crate::framebuffer::Framebuffer;
use crate::stats::{track_cache_init, ClientCacheStats};
use rfb_cache::stats::UnifiedCacheStats;
use rfb_cache::UnifiedCache;
use rfb_common::{CacheKey, Rect};
use rfb_encodings::{DecoderRegistry, PixelFormat};
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::cache::{
    CacheEviction, CachedRect, CachedRectInit, CachedRectSeed, PersistentCacheEviction,
    PersistentCacheHashReport, PersistentCacheQuery, PersistentCachedRect,
    PersistentCachedRectInit, PersistentHashList, RequestCachedData,
};
use rfb_protocol::messages::types::{
    FramebufferUpdateHeader, Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT,
    ENCODING_CACHED_RECT_SEED, ENCODING_LAST_RECT, ENCODING_PERSISTENT_CACHED_RECT,
    ENCODING_PERSISTENT_CACHED_RECT_INIT, PSEUDO_ENCODING_CONTENT_CACHE,
    PSEUDO_ENCODING_PERSISTENT_CACHE,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Which cache protocol the server actually used on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheProtocolNegotiated {
    #[default]
    None,
    Content,
    Persistent,
}

/// The viewer-side cache session.
pub struct CacheSession {
    config: ViewerConfig,
    framebuffer: Arc<tokio::sync::Mutex<Framebuffer>>,
    cache: Arc<parking_lot::Mutex<UnifiedCache>>,
    stats: Arc<parking_lot::Mutex<ClientCacheStats>>,
    registry: Arc<DecoderRegistry>,
    pool: DecodePool,
    negotiated: CacheProtocolNegotiated,
    server_pf: PixelFormat,
    flush_count: u32,
    hash_list_seq: u32,
}

impl CacheSession {
    /// Build a session for a framebuffer of `width` x `height` whose wire
    /// format is `server_pf`. Must be called within a tokio runtime (the
    /// decode workers are spawned here).
    ///
    /// Disk problems degrade to memory-only operation with a warning; they
    /// never fail session setup.
    pub fn new(config: ViewerConfig, width: u32, height: u32, server_pf: PixelFormat) -> Self {
        let mut cache = UnifiedCache::new(config.cache.clone());
        if config.cache.persistent_cache && config.cache.disk_enabled() {
            if let Err(e) = cache.load_index() {
                tracing::warn!(error = %e, "persistent cache disk unavailable, memory-only");
            }
        }

        let framebuffer = Arc::new(tokio::sync::Mutex::new(Framebuffer::new(
            width, height, server_pf,
        )));
        let cache = Arc::new(parking_lot::Mutex::new(cache));
        let stats = Arc::new(parking_lot::Mutex::new(ClientCacheStats::default()));
        let inflight = Arc::new(InFlightTable::default());
        let registry = Arc::new(DecoderRegistry::with_standard());

        let ctx = Arc::new(WorkerContext {
            framebuffer: framebuffer.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            server_pf,
            stats: stats.clone(),
            inflight,
        });
        let pool = DecodePool::spawn(
            ctx.clone(),
            config.decode.effective_workers(),
            config.decode.queue_depth,
        );

        Self {
            config,
            framebuffer,
            cache,
            stats,
            registry,
            pool,
            negotiated: CacheProtocolNegotiated::None,
            server_pf,
            flush_count: 0,
            hash_list_seq: 1,
        }
    }

    /// Pseudo-encodings to include in SetEncodings, per configuration.
    pub fn advertised_pseudo_encodings(&self) -> Vec<i32> {
        let mut encodings = Vec::new();
        if self.config.cache.content_cache {
            encodings.push(PSEUDO_ENCODING_CONTENT_CACHE);
        }
        if self.config.cache.persistent_cache {
            encodings.push(PSEUDO_ENCODING_PERSISTENT_CACHE);
        }
        encodings
    }

    /// Which cache protocol the server has used so far.
    pub fn negotiated(&self) -> CacheProtocolNegotiated {
        self.negotiated
    }

    /// Shared handle to the framebuffer (for display layers).
    pub fn framebuffer(&self) -> Arc<tokio::sync::Mutex<Framebuffer>> {
        self.framebuffer.clone()
    }

    /// Advertise previously persisted content after (re)connecting, as
    /// chunked `PersistentHashList` messages. A no-op when the persistent
    /// cache holds nothing.
    pub async fn send_startup_hash_list<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut RfbOutStream<W>,
    ) -> Result<(), RfbClientError> {
        if !self.config.cache.persistent_cache {
            return Ok(());
        }
        let ids = self.cache.lock().advertised_content_ids();
        if ids.is_empty() {
            return Ok(());
        }
        let seq = self.hash_list_seq;
        self.hash_list_seq = self.hash_list_seq.wrapping_add(1);
        for chunk in PersistentHashList::chunked(seq, &ids) {
            chunk.write_to(out)?;
        }
        out.flush().await?;
        tracing::info!(count = ids.len(), "advertised persisted cache entries");
        Ok(())
    }

    /// Apply one framebuffer update: read every rectangle, dispatch decode
    /// work, then run the flush sequence. Returns the damaged regions.
    ///
    /// The caller has already consumed the message-type byte.
    pub async fn apply_update<R, W>(
        &mut self,
        stream: &mut RfbInStream<R>,
        out: &mut RfbOutStream<W>,
    ) -> Result<Vec<Rect>, RfbClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header = FramebufferUpdateHeader::read_from(stream).await?;
        let mut damage = Vec::new();

        for _ in 0..header.rect_count {
            let wire_rect = Rectangle::read_from(stream).await?;
            if wire_rect.encoding == ENCODING_LAST_RECT {
                break;
            }
            let rect = wire_rect.bounds();

            match wire_rect.encoding {
                ENCODING_CACHED_RECT => {
                    let body = CachedRect::read_from(stream).await?;
                    self.note_negotiated(CacheProtocolNegotiated::Content);
                    if body.content_id == 0 {
                        self.handle_clear_all(rect).await?;
                        continue;
                    }
                    track_reference(&mut self.stats.lock(), false, &rect, self.bpp_bytes());
                    self.submit(rect, WorkKind::Reference {
                        reference: CacheRef::Content(body.content_id),
                    })
                    .await?;
                    damage.push(rect);
                }

                ENCODING_PERSISTENT_CACHED_RECT => {
                    let body = PersistentCachedRect::read_from(stream).await?;
                    self.note_negotiated(CacheProtocolNegotiated::Persistent);
                    if body.key.is_zero() {
                        self.handle_clear_all(rect).await?;
                        continue;
                    }
                    track_reference(&mut self.stats.lock(), true, &rect, self.bpp_bytes());
                    self.submit(rect, WorkKind::Reference {
                        reference: CacheRef::Persistent(body.key),
                    })
                    .await?;
                    damage.push(rect);
                }

                ENCODING_CACHED_RECT_INIT => {
                    let body = CachedRectInit::read_from(stream).await?;
                    self.note_negotiated(CacheProtocolNegotiated::Content);
                    let (payload, lossless) = self
                        .read_inner_payload(stream, &wire_rect, body.inner_encoding)
                        .await?;
                    track_cache_init(&mut self.stats.lock().content, 8, payload.len() as u64);
                    self.submit(rect, WorkKind::Init {
                        reference: CacheRef::Content(body.content_id),
                        inner_encoding: body.inner_encoding,
                        payload,
                        lossless,
                    })
                    .await?;
                    damage.push(rect);
                }

                ENCODING_PERSISTENT_CACHED_RECT_INIT => {
                    let body = PersistentCachedRectInit::read_from(stream).await?;
                    self.note_negotiated(CacheProtocolNegotiated::Persistent);
                    let (payload, lossless) = self
                        .read_inner_payload(stream, &wire_rect, body.inner_encoding)
                        .await?;
                    track_cache_init(
                        &mut self.stats.lock().persistent,
                        16,
                        payload.len() as u64,
                    );
                    self.submit(rect, WorkKind::Init {
                        reference: CacheRef::Persistent(body.key),
                        inner_encoding: body.inner_encoding,
                        payload,
                        lossless,
                    })
                    .await?;
                    damage.push(rect);
                }

                ENCODING_CACHED_RECT_SEED => {
                    let body = CachedRectSeed::read_from(stream).await?;
                    self.note_negotiated(CacheProtocolNegotiated::Persistent);
                    self.submit(rect, WorkKind::Seed { key: body.key }).await?;
                }

                encoding => {
                    let (payload, _) = self.read_inner_payload(stream, &wire_rect, encoding).await?;
                    self.submit(rect, WorkKind::Normal { encoding, payload })
                        .await?;
                    damage.push(rect);
                }
            }
        }

        self.flush(out).await?;
        Ok(damage)
    }

    /// Run the flush sequence (see module docs for the ordering).
    pub async fn flush<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut RfbOutStream<W>,
    ) -> Result<(), RfbClientError> {
        // (1) decode queue drained before anything is reported.
        self.pool.drain().await;

        let (evictions, queries, reports) = {
            let mut cache = self.cache.lock();
            (
                cache.drain_pending_evictions(),
                cache.drain_pending_queries(),
                cache.drain_pending_reports(),
            )
        };

        // (2) evictions strictly before (3) queries: eviction causality.
        if !evictions.is_empty() {
            match self.negotiated {
                CacheProtocolNegotiated::Persistent => {
                    for msg in PersistentCacheEviction::chunked(&evictions) {
                        msg.write_to(out)?;
                    }
                }
                _ => {
                    let ids: Vec<u64> = evictions.iter().map(CacheKey::content_id).collect();
                    for msg in CacheEviction::chunked(&ids) {
                        msg.write_to(out)?;
                    }
                }
            }
            self.stats.lock().counters.evictions_sent += evictions.len() as u32;
        }

        if !queries.is_empty() {
            match self.negotiated {
                CacheProtocolNegotiated::Persistent => {
                    for msg in PersistentCacheQuery::chunked(&queries) {
                        msg.write_to(out)?;
                    }
                }
                _ => {
                    for key in &queries {
                        RequestCachedData {
                            content_id: key.content_id(),
                        }
                        .write_to(out);
                    }
                }
            }
            self.stats.lock().counters.queries_sent += queries.len() as u32;
        }

        // (4) lossy hash reports.
        for (canonical, actual) in &reports {
            PersistentCacheHashReport {
                canonical: *canonical,
                actual: *actual,
            }
            .write_to(out);
        }
        if !reports.is_empty() {
            self.stats.lock().counters.reports_sent += reports.len() as u32;
        }

        out.flush().await?;

        // (5) opportunistic hydration, bounded per boundary.
        {
            let mut cache = self.cache.lock();
            cache.hydrate_next_batch(self.config.decode.hydrate_batch);
        }

        // (6) periodic dirty-index persistence.
        self.flush_count = self.flush_count.wrapping_add(1);
        if self.flush_count % self.config.decode.index_save_interval.max(1) == 0 {
            let mut cache = self.cache.lock();
            if let Err(e) = cache.flush_dirty_index() {
                tracing::warn!(error = %e, "periodic index save failed");
            }
        }

        Ok(())
    }

    /// Tear the session down: drain once, stop the workers, and persist
    /// the index when the persistent protocol was active. Logs the
    /// end-of-session statistics summary.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;

        {
            let mut cache = self.cache.lock();
            if self.negotiated == CacheProtocolNegotiated::Persistent
                && cache.config().disk_enabled()
            {
                if let Err(e) = cache.save_index() {
                    tracing::warn!(error = %e, "final index save failed");
                }
            }
        }

        let stats = *self.stats.lock();
        tracing::info!("{}", stats.content.format_summary("ContentCache"));
        tracing::info!("{}", stats.persistent.format_summary("PersistentCache"));
        tracing::info!(
            lookups = stats.counters.cache_lookups,
            hits = stats.counters.cache_hits,
            misses = stats.counters.cache_misses,
            queries = stats.counters.queries_sent,
            "cache session closed"
        );
    }

    /// Session statistics snapshot.
    pub fn stats(&self) -> ClientCacheStats {
        *self.stats.lock()
    }

    /// Cache engine statistics snapshot.
    pub fn cache_stats(&self) -> UnifiedCacheStats {
        self.cache.lock().stats()
    }

    // -- internals ---------------------------------------------------------

    async fn submit(&mut self, rect: Rect, kind: WorkKind) -> Result<(), RfbClientError> {
        self.pool
            .submit(rect, kind)
            .await
            .map_err(|()| RfbClientError::ConnectionClosed)
    }

    async fn read_inner_payload<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut RfbInStream<R>,
        wire_rect: &Rectangle,
        encoding: i32,
    ) -> Result<(bytes::Bytes, bool), RfbClientError> {
        // A registry miss is fatal: without the decoder's framing we
        // cannot even skip the payload.
        let Some(lossless) = self.registry.is_lossless(encoding) else {
            return Err(RfbClientError::Protocol(format!(
                "no decoder for inner encoding {encoding}"
            )));
        };
        let inner_rect = Rectangle {
            encoding,
            ..*wire_rect
        };
        let payload = self
            .registry
            .read_payload(encoding, stream, &inner_rect, &self.server_pf)
            .await?;
        Ok((payload, lossless))
    }

    async fn handle_clear_all(&mut self, rect: Rect) -> Result<(), RfbClientError> {
        if !rect.is_empty() {
            return Err(RfbClientError::Protocol(
                "zero cache id with non-empty rectangle".into(),
            ));
        }
        // Serialise with in-flight work before wiping state.
        self.pool.drain().await;
        self.cache.lock().clear_session();
        Ok(())
    }

    fn note_negotiated(&mut self, seen: CacheProtocolNegotiated) {
        let upgraded = match (self.negotiated, seen) {
            (CacheProtocolNegotiated::None, new) => new,
            (CacheProtocolNegotiated::Content, CacheProtocolNegotiated::Persistent) => {
                CacheProtocolNegotiated::Persistent
            }
            (current, _) => current,
        };
        if upgraded != self.negotiated {
            self.negotiated = upgraded;
            if upgraded == CacheProtocolNegotiated::Persistent {
                self.cache.lock().set_session_persistable(true);
            }
            tracing::info!(?upgraded, "cache protocol negotiated");
        }
    }

    fn bpp_bytes(&self) -> u64 {
        (self.server_pf.bits_per_pixel / 8) as u64
    }
}
