//! hls-tail: follow a live HLS stream and receive each newly published segment once.
//!
//! ## Core Types
//!
//! - [`HlsPoller`] - Resolves a rendition, refreshes its playlist and fetches new segments
//! - [`SegmentHandler`] - Callback invoked for every downloaded [`MediaSegment`]
//! - [`SegmentFetcher`] - HTTP seam, implemented by [`HttpFetcher`]
//! - [`MasterPlaylistSource`] - Where a session gets its starting URL
//!   ([`TwitchUsherSource`], [`StaticPlaylistSource`])

pub mod config;
pub mod error;
pub mod fetcher;
pub mod playlist;
pub mod poller;
pub mod twitch;

pub use config::{PollerConfig, VariantSelectionPolicy, install_rustls_provider};
pub use error::HlsError;
pub use fetcher::{HttpFetcher, SegmentFetcher};
pub use playlist::{PlaylistSnapshot, Rendition, SegmentRef};
pub use poller::{HlsPoller, MediaSegment, RunOutcome, SegmentHandler};
pub use twitch::{MasterPlaylistSource, StaticPlaylistSource, TwitchUsherSource};
