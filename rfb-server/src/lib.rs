//! Server-side cache coordination.
//!
//! Everything the server needs to run the cache protocols against one
//! connected viewer:
//!
//! - [`tracker`] - per-client mirror of what the viewer holds (known keys,
//!   lossy mappings, hash-list reassembly); driven solely by client
//!   messages and dropped with the connection
//! - [`content_store`] - byte-bounded retention of recently sent payloads
//!   so queries can be answered without re-encoding
//! - [`encode`] - the per-subrect decision procedure (normal / init /
//!   reference / seed) and update serialisation
//! - [`scanner`] - the optional shift-tolerant pre-pass that re-hashes
//!   damage at multiple tile sizes and phases
//!
//! Each connection owns its tracker and encode orchestrator on its own
//! task; nothing here is shared across connections.
//!
//! ```no_run
//! use rfb_server::{ClientCacheTracker, ClientCapabilities, EncodeOrchestrator, ServerCacheConfig};
//! use rfb_encodings::{EncoderSelector, PixelFormat};
//! use rfb_common::{Rect, Region};
//! use rfb_protocol::RfbOutStream;
//!
//! # async fn example<W>(pb: &dyn rfb_encodings::PixelBuffer, writer: W) -> anyhow::Result<()>
//! # where W: tokio::io::AsyncWrite + Unpin {
//! let mut tracker = ClientCacheTracker::new(ClientCapabilities {
//!     content_cache: true,
//!     persistent_cache: true,
//! });
//! let mut encoder = EncodeOrchestrator::new(
//!     ServerCacheConfig::default(),
//!     EncoderSelector::lossless(),
//! );
//!
//! let mut out = RfbOutStream::new(writer);
//! let damage = Region::from_rect(Rect::new(0, 0, 1920, 1080));
//! encoder
//!     .write_update(pb, &damage, &mut tracker, &PixelFormat::canonical(), &mut out)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod content_store;
pub mod encode;
pub mod scanner;
pub mod tracker;

pub use config::{PhaseMode, ScannerConfig, SeedPolicy, ServerCacheConfig};
pub use content_store::{ServerContentStore, StoredPayload};
pub use encode::{EncodeOrchestrator, UpdateSummary};
pub use scanner::{ScanHit, ScanResult, ScanStats, ShiftScanner};
pub use tracker::{ClientCacheTracker, ClientCapabilities, TrackerAction};
