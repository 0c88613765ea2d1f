// HLS polling client: resolves a rendition, refreshes its playlist, and hands newly
// published segments to a handler.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::HlsError;
use crate::config::PollerConfig;
use crate::fetcher::SegmentFetcher;
use crate::playlist::{
    ParsedPlaylist, PlaylistSnapshot, SegmentRef, parse_media_playlist, parse_playlist,
    select_rendition,
};

/// A downloaded media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub sequence_id: u64,
    pub payload: Bytes,
    /// Seconds.
    pub duration: f64,
}

/// Receives every segment the poller successfully downloads.
pub trait SegmentHandler: Send + Sync {
    fn on_segment(&self, segment: MediaSegment);
}

impl<F> SegmentHandler for F
where
    F: Fn(MediaSegment) + Send + Sync,
{
    fn on_segment(&self, segment: MediaSegment) {
        self(segment)
    }
}

/// Why [`HlsPoller::run`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The playlist carried `#EXT-X-ENDLIST`.
    Ended,
    /// The cancellation token fired.
    Cancelled,
}

pub struct HlsPoller<F: SegmentFetcher> {
    fetcher: Arc<F>,
    handler: Arc<dyn SegmentHandler>,
    config: PollerConfig,
}

impl<F: SegmentFetcher + 'static> HlsPoller<F> {
    pub fn new(fetcher: Arc<F>, handler: Arc<dyn SegmentHandler>, config: PollerConfig) -> Self {
        Self {
            fetcher,
            handler,
            config,
        }
    }

    /// Resolve `master_url` to the media playlist that will be polled.
    ///
    /// A URL that already serves a media playlist is returned unchanged.
    pub async fn resolve(&self, master_url: &Url) -> Result<Url, HlsError> {
        let bytes = self.fetcher.fetch(master_url).await?;

        match parse_playlist(&bytes, master_url)? {
            ParsedPlaylist::Master(renditions) => {
                let rendition = select_rendition(&renditions, self.config.variant_policy)?;
                info!(
                    rendition = %rendition.uri,
                    bandwidth = rendition.bandwidth,
                    available = renditions.len(),
                    "Resolved rendition from master playlist"
                );
                Ok(rendition.uri.clone())
            }
            ParsedPlaylist::Media(_) => {
                debug!(url = %master_url, "URL already serves a media playlist");
                Ok(master_url.clone())
            }
        }
    }

    pub async fn poll_once(&self, rendition_url: &Url) -> Result<PlaylistSnapshot, HlsError> {
        let bytes = self.fetcher.fetch(rendition_url).await?;
        parse_media_playlist(&bytes, rendition_url)
    }

    /// Fetch every segment of `current` not present in `previous` concurrently and
    /// deliver the successful ones to the handler.
    ///
    /// All fetches are awaited before returning. A failed fetch is logged and the
    /// segment is skipped for good. Returns the number of segments delivered.
    pub async fn diff_and_fetch(
        &self,
        current: &PlaylistSnapshot,
        previous: Option<&PlaylistSnapshot>,
    ) -> usize {
        let fresh = current.new_segments(previous);
        if fresh.is_empty() {
            return 0;
        }

        debug!(count = fresh.len(), "New segments advertised");

        let downloads = fresh.into_iter().map(|segment| self.fetch_segment(segment));
        join_all(downloads)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn fetch_segment(&self, segment: &SegmentRef) -> bool {
        match self.fetcher.fetch(&segment.uri).await {
            Ok(payload) => {
                self.handler.on_segment(MediaSegment {
                    sequence_id: segment.sequence_id,
                    payload,
                    duration: segment.duration,
                });
                true
            }
            Err(e) => {
                warn!(
                    msn = segment.sequence_id,
                    uri = %segment.uri,
                    error = %e,
                    "Segment fetch failed, dropping segment"
                );
                false
            }
        }
    }

    /// Poll `master_url` until the playlist ends, `token` is cancelled, or a
    /// playlist refresh fails.
    pub async fn run(
        &self,
        master_url: &Url,
        token: CancellationToken,
    ) -> Result<RunOutcome, HlsError> {
        let rendition_url = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(RunOutcome::Cancelled),
            resolved = self.resolve(master_url) => resolved?,
        };

        let mut previous: Option<PlaylistSnapshot> = None;

        loop {
            if token.is_cancelled() {
                info!(url = %rendition_url, "Polling cancelled");
                return Ok(RunOutcome::Cancelled);
            }

            let current = self.poll_once(&rendition_url).await?;
            let delivered = self.diff_and_fetch(&current, previous.as_ref()).await;
            debug!(
                delivered,
                advertised = current.segments.len(),
                "Playlist refresh processed"
            );

            if current.closed {
                info!(url = %rendition_url, "ENDLIST reached, stopping polling");
                return Ok(RunOutcome::Ended);
            }

            let refresh_delay = self.refresh_delay(&current);
            previous = Some(current);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(url = %rendition_url, "Polling cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                _ = tokio::time::sleep(refresh_delay) => {}
            }
        }
    }

    fn refresh_delay(&self, snapshot: &PlaylistSnapshot) -> Duration {
        self.config
            .refresh_interval
            .unwrap_or(snapshot.target_duration)
            .max(self.config.min_refresh_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FakeFetcher {
        responses: Mutex<HashMap<String, Vec<Bytes>>>,
        failing: HashSet<String>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn respond(&self, url: &str, body: &str) {
            self.responses
                .lock()
                .entry(url.to_string())
                .or_default()
                .push(Bytes::from(body.to_string()));
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl SegmentFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url) -> Result<Bytes, HlsError> {
            self.requests.lock().push(url.to_string());
            if self.failing.contains(url.as_str()) {
                return Err(HlsError::http_status(
                    reqwest::StatusCode::NOT_FOUND,
                    url.as_str(),
                    "fetch",
                ));
            }

            let mut responses = self.responses.lock();
            let queue = responses
                .get_mut(url.as_str())
                .ok_or_else(|| HlsError::playlist(format!("no fake response for {url}")))?;
            // The last response is sticky so repeated refreshes keep working.
            if queue.len() > 1 {
                Ok(queue.remove(0))
            } else {
                Ok(queue[0].clone())
            }
        }
    }

    fn collecting_handler() -> (Arc<dyn SegmentHandler>, Arc<Mutex<Vec<MediaSegment>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let handler: Arc<dyn SegmentHandler> =
            Arc::new(move |segment: MediaSegment| sink.lock().push(segment));
        (handler, collected)
    }

    fn snapshot(ids: &[u64]) -> PlaylistSnapshot {
        PlaylistSnapshot {
            segments: ids
                .iter()
                .map(|id| SegmentRef {
                    sequence_id: *id,
                    duration: 2.0,
                    uri: Url::parse(&format!("https://cdn.test/{id}.ts")).unwrap(),
                })
                .collect(),
            closed: false,
            target_duration: Duration::from_secs(2),
        }
    }

    fn media_playlist(first: u64, count: u64, closed: bool) -> String {
        let mut body = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
        );
        for id in first..first + count {
            body.push_str(&format!("#EXTINF:2.000,\nhttps://cdn.test/{id}.ts\n"));
        }
        if closed {
            body.push_str("#EXT-X-ENDLIST\n");
        }
        body
    }

    #[tokio::test]
    async fn fetches_only_segments_missing_from_previous_tick() {
        let fetcher = Arc::new(FakeFetcher::default());
        for id in 1..=5 {
            fetcher.respond(&format!("https://cdn.test/{id}.ts"), &format!("seg-{id}"));
        }
        let (handler, collected) = collecting_handler();
        let poller = HlsPoller::new(fetcher.clone(), handler, PollerConfig::default());

        let previous = snapshot(&[1, 2, 3]);
        let current = snapshot(&[2, 3, 4, 5]);
        let delivered = poller.diff_and_fetch(&current, Some(&previous)).await;

        assert_eq!(delivered, 2);
        let mut requested = fetcher.requests();
        requested.sort();
        assert_eq!(
            requested,
            vec!["https://cdn.test/4.ts", "https://cdn.test/5.ts"]
        );

        let mut ids: Vec<u64> = collected.lock().iter().map(|s| s.sequence_id).collect();
        ids.sort();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn failed_segment_is_dropped_without_retry() {
        let fetcher = Arc::new(FakeFetcher {
            failing: HashSet::from(["https://cdn.test/2.ts".to_string()]),
            ..Default::default()
        });
        fetcher.respond("https://cdn.test/1.ts", "one");
        let (handler, collected) = collecting_handler();
        let poller = HlsPoller::new(fetcher.clone(), handler, PollerConfig::default());

        let delivered = poller.diff_and_fetch(&snapshot(&[1, 2]), None).await;

        assert_eq!(delivered, 1);
        assert_eq!(fetcher.requests().len(), 2);
        let segments = collected.lock();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].sequence_id, 1);
        assert_eq!(segments[0].payload, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn resolve_uses_media_playlist_directly() {
        let fetcher = Arc::new(FakeFetcher::default());
        let url = "https://cdn.test/live.m3u8";
        fetcher.respond(url, &media_playlist(1, 2, false));
        let (handler, _) = collecting_handler();
        let poller = HlsPoller::new(fetcher, handler, PollerConfig::default());

        let resolved = poller.resolve(&Url::parse(url).unwrap()).await.unwrap();
        assert_eq!(resolved.as_str(), url);
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_new_segments_until_endlist() {
        let fetcher = Arc::new(FakeFetcher::default());
        let master = "https://cdn.test/master.m3u8";
        let media = "https://cdn.test/chunked.m3u8";
        fetcher.respond(
            master,
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000\nchunked.m3u8\n",
        );
        fetcher.respond(media, &media_playlist(1, 3, false));
        fetcher.respond(media, &media_playlist(2, 3, true));
        for id in 1..=4 {
            fetcher.respond(&format!("https://cdn.test/{id}.ts"), "x");
        }
        let (handler, collected) = collecting_handler();
        let poller = HlsPoller::new(fetcher, handler, PollerConfig::default());

        let outcome = poller
            .run(&Url::parse(master).unwrap(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Ended);
        let mut ids: Vec<u64> = collected.lock().iter().map(|s| s.sequence_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_when_cancelled() {
        let fetcher = Arc::new(FakeFetcher::default());
        let media = "https://cdn.test/live.m3u8";
        fetcher.respond(media, &media_playlist(1, 1, false));
        fetcher.respond("https://cdn.test/1.ts", "x");
        let (handler, _) = collecting_handler();
        let poller = HlsPoller::new(fetcher, handler, PollerConfig::default());

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let outcome = poller
            .run(&Url::parse(media).unwrap(), token)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn run_surfaces_playlist_errors() {
        let fetcher = Arc::new(FakeFetcher::default());
        let media = "https://cdn.test/broken.m3u8";
        fetcher.respond(media, "not a playlist");
        let (handler, _) = collecting_handler();
        let poller = HlsPoller::new(fetcher, handler, PollerConfig::default());

        let result = poller
            .run(&Url::parse(media).unwrap(), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn fixed_refresh_interval_overrides_target_duration() {
        let config = PollerConfig {
            refresh_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let (handler, _) = collecting_handler();
        let poller = HlsPoller::new(Arc::new(FakeFetcher::default()), handler, config);

        assert_eq!(
            poller.refresh_delay(&snapshot(&[1])),
            Duration::from_secs(1)
        );
    }
}
