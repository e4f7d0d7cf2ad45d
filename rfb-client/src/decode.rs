//! Decode worker pool.
//!
//! The protocol reader turns each rectangle into a [`WorkItem`] carrying
//! its already-framed payload and submits it to a bounded queue; M worker
//! tasks pull items, decode, apply to the framebuffer, and do the cache
//! work. Backpressure comes from the queue bound: the reader blocks when
//! all workers are busy.
//!
//! # Ordering
//!
//! Items are registered in an in-flight table at submit time, in wire
//! order. A worker may not start an item while an earlier-submitted item
//! whose rectangle overlaps it is still in flight; non-overlapping items
//! may complete out of order, which is observationally equivalent to
//! in-order application. Seeds rely on this: a seed always overlaps the
//! rectangle whose pixels it snapshots, so the snapshot happens after that
//! blit.
//!
//! Workers never hold the cache mutex while decoding and never hold it
//! across an await.

use crate::framebuffer::Framebuffer;
use crate::stats::{track_cache_ref, ClientCacheStats};
use rfb_cache::hash::hash_canonical_tile;
use rfb_cache::{RectDigest, UnifiedCache};
use rfb_common::{CacheKey, Rect};
use rfb_encodings::{DecoderRegistry, PixelFormat};
use rfb_pixelbuffer::ManagedPixelBuffer;
use rfb_protocol::messages::types::Rectangle;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Identity carried by a cache envelope: the session-scoped 64-bit content
/// id or the full 16-byte key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheRef {
    Content(u64),
    Persistent(CacheKey),
}

impl CacheRef {
    /// The canonical key this reference indexes under (content ids widen
    /// into a zero-padded key).
    pub(crate) fn canonical_key(&self) -> CacheKey {
        match self {
            Self::Content(id) => CacheKey::from_content_id(*id),
            Self::Persistent(key) => *key,
        }
    }

    /// Does a freshly computed digest agree with this identity? Content
    /// ids compare on the 8-byte prefix, full keys on all 16 bytes.
    fn matches_digest(&self, digest: &RectDigest) -> bool {
        match self {
            Self::Content(id) => digest.key.content_id() == *id,
            Self::Persistent(key) => digest.key == *key,
        }
    }

    fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }
}

/// One unit of decode work.
#[derive(Debug)]
pub(crate) enum WorkKind {
    /// Plain rectangle in an inner encoding.
    Normal { encoding: i32, payload: Bytes },
    /// Cache init: decode, blit, hash, insert.
    Init {
        reference: CacheRef,
        inner_encoding: i32,
        payload: Bytes,
        lossless: bool,
    },
    /// Cache reference: blit from cache, or queue a query on miss.
    Reference { reference: CacheRef },
    /// Seed: snapshot the framebuffer region and cache it under `key`.
    Seed { key: CacheKey },
}

#[derive(Debug)]
pub(crate) struct WorkItem {
    pub seq: u64,
    pub rect: Rect,
    pub kind: WorkKind,
}

/// Submitted-but-unfinished items, for overlap serialisation and drain.
#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: parking_lot::Mutex<Vec<(u64, Rect)>>,
    notify: Notify,
}

impl InFlightTable {
    fn register(&self, seq: u64, rect: Rect) {
        self.entries.lock().push((seq, rect));
    }

    /// Wait until no earlier-submitted overlapping item is in flight.
    async fn wait_turn(&self, seq: u64, rect: &Rect) {
        loop {
            // Register for wakeups before checking, so a completion
            // between the check and the await cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let entries = self.entries.lock();
                let blocked = entries
                    .iter()
                    .any(|(other, r)| *other < seq && r.intersects(rect));
                if !blocked {
                    return;
                }
            }
            notified.await;
        }
    }

    fn complete(&self, seq: u64) {
        self.entries.lock().retain(|(other, _)| *other != seq);
        self.notify.notify_waiters();
    }

    /// Wait for the whole queue to drain.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.entries.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared state the workers operate on.
pub(crate) struct WorkerContext {
    pub framebuffer: Arc<tokio::sync::Mutex<Framebuffer>>,
    pub cache: Arc<parking_lot::Mutex<UnifiedCache>>,
    pub registry: Arc<DecoderRegistry>,
    pub server_pf: PixelFormat,
    pub stats: Arc<parking_lot::Mutex<ClientCacheStats>>,
    pub inflight: Arc<InFlightTable>,
}

/// The bounded queue and its workers.
pub(crate) struct DecodePool {
    tx: Option<flume::Sender<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
    inflight: Arc<InFlightTable>,
    next_seq: u64,
}

impl DecodePool {
    /// Spawn `workers` tasks over a queue of `queue_depth` items. Must be
    /// called from within a tokio runtime.
    pub(crate) fn spawn(ctx: Arc<WorkerContext>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = flume::bounded::<WorkItem>(queue_depth.max(1));
        let inflight = ctx.inflight.clone();
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                tokio::spawn(worker_loop(ctx, rx, worker_id))
            })
            .collect();
        Self {
            tx: Some(tx),
            handles,
            inflight,
            next_seq: 0,
        }
    }

    /// Submit one item, blocking when the queue is full.
    pub(crate) async fn submit(&mut self, rect: Rect, kind: WorkKind) -> Result<(), ()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight.register(seq, rect);
        let item = WorkItem { seq, rect, kind };
        let Some(tx) = &self.tx else {
            self.inflight.complete(seq);
            return Err(());
        };
        if tx.send_async(item).await.is_err() {
            self.inflight.complete(seq);
            return Err(());
        }
        Ok(())
    }

    /// Wait until every submitted item has been processed.
    pub(crate) async fn drain(&self) {
        self.inflight.wait_idle().await;
    }

    /// Drain, stop the workers, and join them.
    pub(crate) async fn shutdown(mut self) {
        self.inflight.wait_idle().await;
        self.tx.take(); // closes the channel; workers exit their loop
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    ctx: Arc<WorkerContext>,
    rx: flume::Receiver<WorkItem>,
    worker_id: usize,
) {
    tracing::debug!(worker_id, "decode worker started");
    while let Ok(item) = rx.recv_async().await {
        ctx.inflight.wait_turn(item.seq, &item.rect).await;
        if let Err(e) = process(&ctx, &item).await {
            // A failed rectangle is dropped; subsequent references will
            // miss and recover through queries.
            tracing::warn!(seq = item.seq, error = %e, "rectangle dropped");
        }
        ctx.inflight.complete(item.seq);
    }
    tracing::debug!(worker_id, "decode worker stopped");
}

async fn process(ctx: &WorkerContext, item: &WorkItem) -> anyhow::Result<()> {
    match &item.kind {
        WorkKind::Normal { encoding, payload } => {
            let tile = decode_tile(ctx, *encoding, payload, &item.rect)?;
            blit(ctx, item.rect, tile.data()).await
        }

        WorkKind::Init {
            reference,
            inner_encoding,
            payload,
            lossless,
        } => {
            let tile = decode_tile(ctx, *inner_encoding, payload, &item.rect)?;
            let digest =
                hash_canonical_tile(item.rect.width, item.rect.height, tile.data());
            blit(ctx, item.rect, tile.data()).await?;

            if *lossless && !reference.matches_digest(&digest) {
                // Lossless encodings must reproduce the canonical hash; a
                // mismatch signals corruption or a stride bug upstream.
                tracing::info!(
                    expected = %reference.canonical_key(),
                    computed = %digest.key,
                    "hash mismatch on lossless init, not caching"
                );
                return Ok(());
            }

            let canonical = reference.canonical_key();
            let persistable = *lossless || digest.key == canonical;
            let lossy_mismatch = !reference.matches_digest(&digest);
            {
                let mut cache = ctx.cache.lock();
                cache.insert(
                    canonical,
                    digest,
                    tile.data(),
                    &PixelFormat::canonical(),
                    item.rect.width,
                    item.rect.height,
                    persistable,
                )?;
                if lossy_mismatch && reference.is_persistent() {
                    cache.note_hash_report(canonical, digest.key);
                }
            }
            Ok(())
        }

        WorkKind::Reference { reference } => {
            // Zero-area rectangles are uncacheable: miss without a query.
            if item.rect.is_empty() {
                return Ok(());
            }
            let canonical = reference.canonical_key();
            let min_bpp = ctx.server_pf.bits_per_pixel;
            let entry = {
                let mut cache = ctx.cache.lock();
                cache.get_by_canonical(
                    &canonical,
                    item.rect.width,
                    item.rect.height,
                    min_bpp,
                )
            };
            {
                let mut stats = ctx.stats.lock();
                stats.counters.cache_lookups += 1;
                match &entry {
                    Some(_) => stats.counters.cache_hits += 1,
                    None => stats.counters.cache_misses += 1,
                }
            }
            match entry {
                Some(entry) => blit(ctx, item.rect, &entry.pixels).await,
                None => {
                    // Leave the framebuffer untouched; the region stays
                    // stale until the queried init arrives.
                    ctx.cache.lock().note_query(canonical);
                    Ok(())
                }
            }
        }

        WorkKind::Seed { key } => {
            let snapshot = {
                let fb = ctx.framebuffer.lock().await;
                fb.snapshot(item.rect)?
            };
            let outcome = {
                let mut cache = ctx.cache.lock();
                cache.store_seed(
                    *key,
                    &snapshot,
                    &PixelFormat::canonical(),
                    item.rect.width,
                    item.rect.height,
                )?
            };
            let mut stats = ctx.stats.lock();
            stats.counters.seeds_stored += 1;
            if outcome.lossy {
                tracing::debug!(canonical = %key, actual = %outcome.actual, "lossy seed stored");
            }
            Ok(())
        }
    }
}

fn decode_tile(
    ctx: &WorkerContext,
    encoding: i32,
    payload: &[u8],
    rect: &Rect,
) -> anyhow::Result<ManagedPixelBuffer> {
    let mut tile = ManagedPixelBuffer::new(rect.width, rect.height, PixelFormat::canonical());
    let wire_rect = Rectangle::new(*rect, encoding);
    ctx.registry
        .decode(encoding, payload, &wire_rect, &ctx.server_pf, &mut tile)?;
    Ok(tile)
}

async fn blit(ctx: &WorkerContext, rect: Rect, pixels: &[u8]) -> anyhow::Result<()> {
    let mut fb = ctx.framebuffer.lock().await;
    fb.blit_canonical(rect, pixels)
}

/// Convenience for the session layer: account a reference that was served
/// or missed (wire cost is the same either way).
pub(crate) fn track_reference(
    stats: &mut ClientCacheStats,
    persistent: bool,
    rect: &Rect,
    bpp_bytes: u64,
) {
    let (bucket, body) = if persistent {
        (&mut stats.persistent, 16)
    } else {
        (&mut stats.content, 8)
    };
    track_cache_ref(bucket, rect, bpp_bytes, body);
}
