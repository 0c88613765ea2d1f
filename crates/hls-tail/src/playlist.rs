// Playlist Resolver: parses master/media playlists into the structures the poller diffs.

use std::collections::HashSet;
use std::time::Duration;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, parse_playlist_res};
use tracing::{debug, warn};
use url::Url;

use crate::HlsError;
use crate::config::VariantSelectionPolicy;

/// One quality variant advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub uri: Url,
    pub bandwidth: u64,
}

/// A segment as advertised by one media playlist refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub sequence_id: u64,
    /// Seconds, from `#EXTINF`.
    pub duration: f64,
    pub uri: Url,
}

/// The segment set advertised at one poll tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSnapshot {
    pub segments: Vec<SegmentRef>,
    /// `#EXT-X-ENDLIST` was present.
    pub closed: bool,
    pub target_duration: Duration,
}

impl PlaylistSnapshot {
    /// Segments of `self` whose sequence id is absent from `previous`.
    pub fn new_segments<'a>(&'a self, previous: Option<&PlaylistSnapshot>) -> Vec<&'a SegmentRef> {
        let Some(previous) = previous else {
            return self.segments.iter().collect();
        };

        let seen: HashSet<u64> = previous.segments.iter().map(|s| s.sequence_id).collect();
        self.segments
            .iter()
            .filter(|s| !seen.contains(&s.sequence_id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum ParsedPlaylist {
    Master(Vec<Rendition>),
    Media(PlaylistSnapshot),
}

/// Parse playlist bytes fetched from `playlist_url`, resolving relative URIs against it.
pub fn parse_playlist(bytes: &[u8], playlist_url: &Url) -> Result<ParsedPlaylist, HlsError> {
    match parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => {
            Ok(ParsedPlaylist::Master(renditions(&pl, playlist_url)?))
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => {
            Ok(ParsedPlaylist::Media(snapshot(&pl, playlist_url)?))
        }
        Err(e) => Err(HlsError::playlist(format!(
            "Failed to parse playlist {playlist_url}: {e}"
        ))),
    }
}

/// Parse bytes that must be a media playlist.
pub fn parse_media_playlist(bytes: &[u8], playlist_url: &Url) -> Result<PlaylistSnapshot, HlsError> {
    match parse_playlist(bytes, playlist_url)? {
        ParsedPlaylist::Media(snapshot) => Ok(snapshot),
        ParsedPlaylist::Master(_) => Err(HlsError::playlist(format!(
            "Expected Media Playlist, got Master for {playlist_url}"
        ))),
    }
}

fn renditions(playlist: &MasterPlaylist, base: &Url) -> Result<Vec<Rendition>, HlsError> {
    playlist
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| {
            let uri = base.join(&v.uri).map_err(|e| {
                HlsError::playlist(format!(
                    "Could not join master URL with variant URI {}: {e}",
                    v.uri
                ))
            })?;
            Ok(Rendition {
                uri,
                bandwidth: v.bandwidth,
            })
        })
        .collect()
}

fn snapshot(playlist: &MediaPlaylist, base: &Url) -> Result<PlaylistSnapshot, HlsError> {
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (idx, segment) in playlist.segments.iter().enumerate() {
        let sequence_id = playlist.media_sequence + idx as u64;

        if segment.uri.trim().is_empty() {
            warn!(msn = sequence_id, "Skipping segment with empty URI");
            continue;
        }

        let uri = base.join(&segment.uri).map_err(|e| {
            HlsError::playlist(format!(
                "Failed to resolve segment URI '{}' with base '{base}': {e}",
                segment.uri
            ))
        })?;

        segments.push(SegmentRef {
            sequence_id,
            duration: segment.duration as f64,
            uri,
        });
    }

    Ok(PlaylistSnapshot {
        segments,
        closed: playlist.end_list,
        target_duration: Duration::from_secs_f64(playlist.target_duration as f64),
    })
}

/// Pick one rendition according to `policy`.
pub fn select_rendition<'a>(
    renditions: &'a [Rendition],
    policy: VariantSelectionPolicy,
) -> Result<&'a Rendition, HlsError> {
    let selected = match policy {
        VariantSelectionPolicy::First => renditions.first(),
        VariantSelectionPolicy::HighestBandwidth => renditions.iter().max_by_key(|r| r.bandwidth),
        VariantSelectionPolicy::LowestBandwidth => renditions.iter().min_by_key(|r| r.bandwidth),
    };

    let selected = selected
        .ok_or_else(|| HlsError::playlist("Master playlist has no variants".to_string()))?;
    debug!(uri = %selected.uri, bandwidth = selected.bandwidth, ?policy, "Selected rendition");
    Ok(selected)
}
