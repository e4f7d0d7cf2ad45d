//! Encode orchestrator.
//!
//! Turns a damage region into one framebuffer update, deciding per subrect
//! between a plain encoded rectangle, a cache init, a reference, or the
//! normal-plus-seed pair:
//!
//! 1. below the minimum area: send normally, no cache interaction
//! 2. hash the canonical pixels; uncacheable rects also go out normally
//! 3. content the client is known to hold becomes a reference
//! 4. fresh lossless content goes out as an init; fresh lossy content goes
//!    out per the seed policy (normal encoding followed by a seed message
//!    by default - seeds are never skipped because an encoding is lossy)
//!
//! Wire order is drawing order. Scanner hits are emitted first and carved
//! out of the residual damage, so references and re-encoded rectangles
//! never overlap within one update.

use crate::config::{SeedPolicy, ServerCacheConfig};
use crate::content_store::{ServerContentStore, StoredPayload};
use crate::scanner::ShiftScanner;
use crate::tracker::{ClientCacheTracker, TrackerAction};
use anyhow::Result;
use bytes::Bytes;
use rfb_cache::hash::hash_rect;
use rfb_common::{CacheKey, Rect, Region};
use rfb_encodings::{EncoderSelector, PixelBuffer, PixelFormat};
use rfb_protocol::io::RfbOutStream;
use rfb_protocol::messages::cache::{
    CachedRect, CachedRectInit, CachedRectSeed, PersistentCachedRect, PersistentCachedRectInit,
};
use rfb_protocol::messages::types::{
    FramebufferUpdateHeader, Rectangle, ENCODING_CACHED_RECT, ENCODING_CACHED_RECT_INIT,
    ENCODING_CACHED_RECT_SEED, ENCODING_PERSISTENT_CACHED_RECT,
    ENCODING_PERSISTENT_CACHED_RECT_INIT,
};
use tokio::io::AsyncWrite;

/// Outcome counters for one update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Rectangles written (seed pairs count as two).
    pub rects_sent: u32,
    pub references: u32,
    pub inits: u32,
    pub seeds: u32,
    pub normal: u32,
    /// References contributed by the shift-tolerant scanner.
    pub scanner_hits: u32,
}

/// One planned wire rectangle (or pair).
enum Plan {
    Normal {
        rect: Rect,
        encoding: i32,
        payload: Bytes,
    },
    Reference {
        rect: Rect,
        canonical: CacheKey,
    },
    Init {
        rect: Rect,
        canonical: CacheKey,
        encoding: i32,
        payload: Bytes,
    },
    /// Normal-encoded rectangle immediately followed by a seed message.
    SeedPair {
        rect: Rect,
        canonical: CacheKey,
        encoding: i32,
        payload: Bytes,
    },
}

impl Plan {
    fn wire_rects(&self) -> u32 {
        match self {
            Plan::SeedPair { .. } => 2,
            _ => 1,
        }
    }
}

/// Per-connection encode pipeline.
pub struct EncodeOrchestrator {
    config: ServerCacheConfig,
    selector: EncoderSelector,
    store: ServerContentStore,
    scanner: ShiftScanner,
}

impl EncodeOrchestrator {
    pub fn new(config: ServerCacheConfig, selector: EncoderSelector) -> Self {
        let store = ServerContentStore::new(config.store_size_mb, config.max_age_secs);
        let scanner = ShiftScanner::new(config.scanner.clone());
        Self {
            config,
            selector,
            store,
            scanner,
        }
    }

    /// The retained-payload store (exposed for maintenance like
    /// [`ServerContentStore::purge_expired`]).
    pub fn store_mut(&mut self) -> &mut ServerContentStore {
        &mut self.store
    }

    /// May cache messages be sent to this client at all?
    fn caching_enabled(&self, tracker: &ClientCacheTracker) -> bool {
        let caps = tracker.capabilities();
        (caps.content_cache && self.config.enable_content_cache)
            || (caps.persistent_cache && self.config.enable_persistent_cache)
    }

    /// Encode and write one framebuffer update covering `damage`.
    pub async fn write_update<W: AsyncWrite + Unpin>(
        &mut self,
        pb: &dyn PixelBuffer,
        damage: &Region,
        tracker: &mut ClientCacheTracker,
        wire_pf: &PixelFormat,
        out: &mut RfbOutStream<W>,
    ) -> Result<UpdateSummary> {
        let caching = self.caching_enabled(tracker);
        let mut summary = UpdateSummary::default();
        let mut plans = Vec::new();
        let mut residual = damage.clone();

        // Scanner pre-pass: known tiles become references and leave the
        // residual damage.
        if caching && self.scanner.config().enabled {
            let scan = self.scanner.scan(pb, damage, &|key| tracker.knows(key));
            for hit in scan.hits {
                residual.subtract(&hit.rect);
                summary.scanner_hits += 1;
                plans.push(Plan::Reference {
                    rect: hit.rect,
                    canonical: hit.key,
                });
            }
        }

        for rect in residual.take_rects() {
            if rect.is_empty() {
                continue;
            }
            plans.push(self.plan_rect(pb, rect, tracker, wire_pf, caching)?);
        }

        let rect_count: u32 = plans.iter().map(Plan::wire_rects).sum();
        FramebufferUpdateHeader {
            rect_count: rect_count as u16,
        }
        .write_to(out);

        for plan in &plans {
            self.write_plan(plan, tracker, out)?;
            match plan {
                Plan::Normal { .. } => summary.normal += 1,
                Plan::Reference { .. } => summary.references += 1,
                Plan::Init { .. } => summary.inits += 1,
                Plan::SeedPair { .. } => {
                    summary.normal += 1;
                    summary.seeds += 1;
                }
            }
        }
        summary.rects_sent = rect_count;

        out.flush().await?;
        tracker.note_update_sent();
        Ok(summary)
    }

    /// Answer queries by re-sending inits from the retained payloads.
    /// Unknown canonicals are logged and ignored. Returns how many inits
    /// went out.
    pub async fn respond_to_queries<W: AsyncWrite + Unpin>(
        &mut self,
        action: &TrackerAction,
        tracker: &mut ClientCacheTracker,
        out: &mut RfbOutStream<W>,
    ) -> Result<u32> {
        let mut keys: Vec<CacheKey> = action.resend.clone();
        for id in &action.resend_ids {
            match self.store.find_by_content_id(*id) {
                Some(key) => keys.push(key),
                None => tracing::debug!(content_id = id, "query for unknown content id ignored"),
            }
        }

        let mut plans = Vec::new();
        for canonical in keys {
            let Some(stored) = self.store.get(&canonical) else {
                tracing::debug!(%canonical, "query for unknown canonical ignored");
                continue;
            };
            let rect = tracker.last_rect(&canonical).unwrap_or(Rect::new(
                0,
                0,
                stored.width as u32,
                stored.height as u32,
            ));
            tracker.note_sent(canonical, rect);
            plans.push(Plan::Init {
                rect,
                canonical,
                encoding: stored.encoding,
                payload: stored.payload,
            });
        }

        if plans.is_empty() {
            return Ok(0);
        }
        FramebufferUpdateHeader {
            rect_count: plans.len() as u16,
        }
        .write_to(out);
        for plan in &plans {
            self.write_plan(plan, tracker, out)?;
        }
        out.flush().await?;
        Ok(plans.len() as u32)
    }

    // -- internals ---------------------------------------------------------

    fn plan_rect(
        &mut self,
        pb: &dyn PixelBuffer,
        rect: Rect,
        tracker: &mut ClientCacheTracker,
        wire_pf: &PixelFormat,
        caching: bool,
    ) -> Result<Plan> {
        let encoder = self.selector.select(rect);

        // Small rectangles skip the cache entirely.
        if !caching || rect.area() < self.config.min_rect_area as u64 {
            return Ok(Plan::Normal {
                rect,
                encoding: encoder.encoding_type(),
                payload: encoder.encode(pb, rect, wire_pf)?,
            });
        }

        // An unhashable rect (zero area cannot happen here, but pixel
        // reads can fail) falls back to the normal path.
        let canonical = match hash_rect(pb, rect) {
            Ok(digest) => digest.key,
            Err(e) => {
                tracing::debug!(error = %e, "uncacheable rect, sending normally");
                return Ok(Plan::Normal {
                    rect,
                    encoding: encoder.encoding_type(),
                    payload: encoder.encode(pb, rect, wire_pf)?,
                });
            }
        };

        if tracker.knows(&canonical) {
            tracker.note_sent(canonical, rect);
            return Ok(Plan::Reference { rect, canonical });
        }

        let payload = encoder.encode(pb, rect, wire_pf)?;
        let encoding = encoder.encoding_type();
        let lossless = encoder.is_lossless();

        self.store.insert(
            canonical,
            StoredPayload::new(
                encoding,
                payload.clone(),
                lossless,
                rect.width as u16,
                rect.height as u16,
            ),
        );
        tracker.note_sent(canonical, rect);

        // Seeds need the full-key message family; content-only clients
        // get the init wrap instead.
        let seed = !lossless
            && tracker.persistent()
            && self.config.seed_policy == SeedPolicy::AlwaysSeed;
        if seed {
            Ok(Plan::SeedPair {
                rect,
                canonical,
                encoding,
                payload,
            })
        } else {
            Ok(Plan::Init {
                rect,
                canonical,
                encoding,
                payload,
            })
        }
    }

    fn write_plan<W: AsyncWrite + Unpin>(
        &self,
        plan: &Plan,
        tracker: &ClientCacheTracker,
        out: &mut RfbOutStream<W>,
    ) -> Result<()> {
        let persistent = tracker.persistent();
        match plan {
            Plan::Normal {
                rect,
                encoding,
                payload,
            } => {
                Rectangle::new(*rect, *encoding).write_to(out);
                out.write_bytes(payload);
            }

            Plan::Reference { rect, canonical } => {
                if persistent {
                    Rectangle::new(*rect, ENCODING_PERSISTENT_CACHED_RECT).write_to(out);
                    PersistentCachedRect::new(*canonical).write_to(out);
                } else {
                    Rectangle::new(*rect, ENCODING_CACHED_RECT).write_to(out);
                    CachedRect::new(canonical.content_id()).write_to(out);
                }
            }

            Plan::Init {
                rect,
                canonical,
                encoding,
                payload,
            } => {
                if persistent {
                    Rectangle::new(*rect, ENCODING_PERSISTENT_CACHED_RECT_INIT).write_to(out);
                    PersistentCachedRectInit::new(*canonical, *encoding).write_to(out)?;
                } else {
                    Rectangle::new(*rect, ENCODING_CACHED_RECT_INIT).write_to(out);
                    CachedRectInit::new(canonical.content_id(), *encoding).write_to(out)?;
                }
                out.write_bytes(payload);
            }

            Plan::SeedPair {
                rect,
                canonical,
                encoding,
                payload,
            } => {
                Rectangle::new(*rect, *encoding).write_to(out);
                out.write_bytes(payload);
                Rectangle::new(*rect, ENCODING_CACHED_RECT_SEED).write_to(out);
                CachedRectSeed::new(*canonical).write_to(out);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ClientCapabilities;
    use rfb_pixelbuffer::{ManagedPixelBuffer, MutablePixelBuffer};

    fn framebuffer(seed: u8) -> ManagedPixelBuffer {
        let pf = PixelFormat::canonical();
        let mut pb = ManagedPixelBuffer::new(256, 256, pf);
        for y in 0..256i32 {
            let px = pf.from_rgb888([seed, (y % 256) as u8, 0x33, 255]);
            pb.fill_rect(Rect::new(0, y, 256, 1), &px).unwrap();
        }
        pb
    }

    fn tracker_with(persistent: bool) -> ClientCacheTracker {
        ClientCacheTracker::new(ClientCapabilities {
            content_cache: true,
            persistent_cache: persistent,
        })
    }

    fn orchestrator(config: ServerCacheConfig) -> EncodeOrchestrator {
        EncodeOrchestrator::new(config, EncoderSelector::lossless())
    }

    async fn run_update(
        orchestrator: &mut EncodeOrchestrator,
        pb: &ManagedPixelBuffer,
        tracker: &mut ClientCacheTracker,
        rect: Rect,
    ) -> (UpdateSummary, Vec<u8>) {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        let summary = orchestrator
            .write_update(
                pb,
                &Region::from_rect(rect),
                tracker,
                &PixelFormat::canonical(),
                &mut out,
            )
            .await
            .unwrap();
        out.flush().await.unwrap();
        (summary, buffer)
    }

    #[tokio::test]
    async fn test_first_occurrence_is_init_second_is_reference() {
        let pb = framebuffer(1);
        let mut tracker = tracker_with(true);
        let mut orchestrator = orchestrator(ServerCacheConfig::default());
        let rect = Rect::new(0, 0, 128, 128);

        let (first, _) = run_update(&mut orchestrator, &pb, &mut tracker, rect).await;
        assert_eq!(first.inits, 1);
        assert_eq!(first.references, 0);

        let (second, bytes) = run_update(&mut orchestrator, &pb, &mut tracker, rect).await;
        assert_eq!(second.inits, 0);
        assert_eq!(second.references, 1);
        // Reference update: 4-byte header + 12-byte rect + 16-byte key.
        assert_eq!(bytes.len(), 4 + 12 + 16);
    }

    #[tokio::test]
    async fn test_small_rects_skip_the_cache() {
        let pb = framebuffer(2);
        let mut tracker = tracker_with(true);
        let mut orchestrator = orchestrator(ServerCacheConfig::default());
        // 32x32 = 1024 px, below the 4096 px default threshold.
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 32, 32)).await;
        assert_eq!(summary.normal, 1);
        assert_eq!(summary.inits, 0);
        assert!(!tracker.knows(
            &hash_rect(&pb, Rect::new(0, 0, 32, 32)).unwrap().key
        ));
    }

    #[tokio::test]
    async fn test_client_without_cache_support_gets_normal_rects() {
        let pb = framebuffer(3);
        let mut tracker = ClientCacheTracker::new(ClientCapabilities::default());
        let mut orchestrator = orchestrator(ServerCacheConfig::default());
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 128, 128)).await;
        assert_eq!(summary.normal, 1);
        assert_eq!(summary.inits, 0);
        assert_eq!(summary.references, 0);
    }

    #[tokio::test]
    async fn test_lossy_encoding_emits_seed_pair() {
        let pb = framebuffer(4);
        let mut tracker = tracker_with(true);
        let mut orchestrator = EncodeOrchestrator::new(
            ServerCacheConfig::default(),
            EncoderSelector::lossy(),
        );
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 128, 128)).await;
        assert_eq!(summary.seeds, 1);
        assert_eq!(summary.normal, 1);
        assert_eq!(summary.rects_sent, 2);
        assert_eq!(summary.inits, 0);
    }

    #[tokio::test]
    async fn test_lossy_to_content_only_client_wraps_in_init() {
        let pb = framebuffer(5);
        let mut tracker = tracker_with(false);
        let mut orchestrator = EncodeOrchestrator::new(
            ServerCacheConfig::default(),
            EncoderSelector::lossy(),
        );
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 128, 128)).await;
        assert_eq!(summary.seeds, 0);
        assert_eq!(summary.inits, 1);
    }

    #[tokio::test]
    async fn test_init_wrap_policy() {
        let pb = framebuffer(6);
        let mut tracker = tracker_with(true);
        let config = ServerCacheConfig {
            seed_policy: SeedPolicy::InitWrap,
            ..Default::default()
        };
        let mut orchestrator =
            EncodeOrchestrator::new(config, EncoderSelector::lossy());
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 128, 128)).await;
        assert_eq!(summary.seeds, 0);
        assert_eq!(summary.inits, 1);
    }

    #[tokio::test]
    async fn test_eviction_then_query_resends_init() {
        let pb = framebuffer(7);
        let mut tracker = tracker_with(true);
        let mut orchestrator = orchestrator(ServerCacheConfig::default());
        let rect = Rect::new(0, 0, 128, 128);
        let canonical = hash_rect(&pb, rect).unwrap().key;

        run_update(&mut orchestrator, &pb, &mut tracker, rect).await;
        assert!(tracker.knows(&canonical));

        // Client evicts, then queries.
        use rfb_protocol::messages::cache::{ClientCacheMessage, PersistentCacheEviction, PersistentCacheQuery};
        tracker.handle_message(&ClientCacheMessage::PersistentCacheEviction(
            PersistentCacheEviction {
                keys: vec![canonical],
            },
        ));
        assert!(!tracker.knows(&canonical));

        let action = tracker.handle_message(&ClientCacheMessage::PersistentCacheQuery(
            PersistentCacheQuery {
                keys: vec![canonical],
            },
        ));
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        let sent = orchestrator
            .respond_to_queries(&action, &mut tracker, &mut out)
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(tracker.knows(&canonical));
        assert!(!buffer.is_empty());
    }

    #[tokio::test]
    async fn test_query_for_unknown_canonical_ignored() {
        let mut tracker = tracker_with(true);
        let mut orchestrator = orchestrator(ServerCacheConfig::default());
        let action = TrackerAction {
            resend: vec![CacheKey::from_bytes([9; 16])],
            resend_ids: vec![1234],
        };
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        let sent = orchestrator
            .respond_to_queries(&action, &mut tracker, &mut out)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_scanner_prepass_turns_known_tiles_into_references() {
        let pb = framebuffer(8);
        let mut tracker = tracker_with(true);
        let config = ServerCacheConfig {
            scanner: crate::config::ScannerConfig {
                enabled: true,
                tile_sizes: vec![64],
                budget_us: 1_000_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut orchestrator = orchestrator(config);

        // Teach the tracker a 64x64 tile via a first update.
        let tile = Rect::new(0, 0, 64, 64);
        run_update(&mut orchestrator, &pb, &mut tracker, tile).await;

        // Damage covering that tile plus fresh area: the tile becomes a
        // scanner reference, the rest re-encodes.
        let (summary, _) =
            run_update(&mut orchestrator, &pb, &mut tracker, Rect::new(0, 0, 128, 64)).await;
        assert!(summary.scanner_hits >= 1);
        assert!(summary.references >= 1);
    }
}
