use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use kiseki::{
    prefetch::{FetchTarget, PrefetchConfig},
    segment::{fixed_uris, InitSegmentReference, SegmentReference},
    ContentType, FetchDispatcher, FetchStatus, KisekiError, KisekiResult, SegmentIndex,
    SegmentPrefetch, Stream,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::AssertWrapper;

/// Dispatcher whose fetches stay pending until released, then resolve to the segment start
/// time.
struct FakeNetwork {
    calls: Mutex<Vec<FetchTarget>>,
    released: watch::Sender<bool>,
    fail: bool,
}

impl FakeNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            released: watch::Sender::new(false),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            released: watch::Sender::new(false),
            fail: true,
        })
    }

    fn release(&self) {
        self.released.send_replace(true);
    }

    fn dispatcher(self: &Arc<Self>) -> FetchDispatcher {
        let network = self.clone();
        Arc::new(move |target: FetchTarget, _stream: Arc<Stream>| {
            network.calls.lock().push(target.clone());
            let mut released = network.released.subscribe();
            let fail = network.fail;
            async move {
                let _ = released.wait_for(|released| *released).await;
                if fail {
                    return Err(KisekiError::HttpError(reqwest::StatusCode::NOT_FOUND));
                }
                let body = match target {
                    FetchTarget::Media(reference) => format!("media {}", reference.start_time()),
                    FetchTarget::Init(_) => "init".to_string(),
                };
                KisekiResult::Ok(Bytes::from(body))
            }
            .boxed()
        })
    }

    fn media_calls(&self) -> usize {
        self.calls.lock().iter().filter(|t| !t.is_init()).count()
    }

    fn init_calls(&self) -> usize {
        self.calls.lock().iter().filter(|t| t.is_init()).count()
    }
}

fn references(count: usize, init: Option<Arc<InitSegmentReference>>) -> Vec<Arc<SegmentReference>> {
    (0..count)
        .map(|i| {
            let mut reference = SegmentReference::new(
                i as f64 * 4.,
                (i + 1) as f64 * 4.,
                fixed_uris(Vec::new()),
            )
            .with_position(i as u64);
            if let Some(init) = &init {
                reference = reference.with_init_segment(init.clone());
            }
            Arc::new(reference)
        })
        .collect()
}

fn stream(id: u64, references: &[Arc<SegmentReference>]) -> Arc<Stream> {
    Arc::new(
        Stream::new(id, ContentType::Video, SegmentIndex::new(references.to_vec()))
            .with_mime_type("video/mp4")
            .with_bandwidth(1_000_000),
    )
}

#[tokio::test]
async fn test_limit_over_four_references() {
    let network = FakeNetwork::new();
    let references = references(4, None);
    let mut prefetch = SegmentPrefetch::new(3, stream(1, &references), network.dispatcher());

    prefetch.prefetch_segments_by_time(references[0].start_time());
    assert_eq!(network.media_calls(), 3);
    prefetch.get_prefetched_segment(&references[3]).assert_error();

    // Repeating the call neither exceeds the bound nor refetches.
    prefetch.prefetch_segments_by_time(references[0].start_time());
    prefetch.prefetch_segments_by_time(references[1].start_time());
    assert_eq!(network.media_calls(), 3);
    assert_eq!(prefetch.prefetched_count(), 3);
}

#[tokio::test]
async fn test_results_reach_caller() -> anyhow::Result<()> {
    let network = FakeNetwork::new();
    let references = references(2, None);
    let mut prefetch = SegmentPrefetch::new(2, stream(1, &references), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    let operation = prefetch.get_prefetched_segment(&references[1]).assert_success();
    assert_eq!(operation.status(), FetchStatus::Fetching);

    let waiter = tokio::spawn({
        let operation = operation.clone();
        async move { operation.wait().await }
    });
    network.release();

    assert_eq!(waiter.await??, Bytes::from_static(b"media 4"));
    assert_eq!(operation.status(), FetchStatus::Fetched);
    Ok(())
}

#[tokio::test]
async fn test_fetch_failure_distinct_from_abort() {
    let network = FakeNetwork::failing();
    let references = references(2, None);
    let mut prefetch = SegmentPrefetch::new(2, stream(1, &references), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    let failed = prefetch.get_prefetched_segment(&references[0]).assert_success();
    let aborted = prefetch.get_prefetched_segment(&references[1]).assert_success();
    aborted.abort();

    network.release();

    let error = failed.wait().await.unwrap_err();
    assert!(!error.is_aborted());
    assert!(matches!(
        error,
        KisekiError::Shared(ref inner) if matches!(**inner, KisekiError::HttpError(_))
    ));
    assert!(aborted.wait().await.unwrap_err().is_aborted());
}

#[tokio::test]
async fn test_evict_aborts_pending() {
    let network = FakeNetwork::new();
    let references = references(4, None);
    let mut prefetch = SegmentPrefetch::new(3, stream(1, &references), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    let first = prefetch.get_prefetched_segment(&references[0]).assert_success();
    let second = prefetch.get_prefetched_segment(&references[1]).assert_success();
    prefetch.evict(references[0].end_time());

    assert_eq!(first.status(), FetchStatus::Aborted);
    assert_eq!(second.status(), FetchStatus::Fetching);
    prefetch.get_prefetched_segment(&references[0]).assert_error();

    // The freed slot goes to the next reference.
    prefetch.prefetch_segments_by_time(0.);
    prefetch.get_prefetched_segment(&references[3]).assert_success();
    assert_eq!(network.media_calls(), 4);
}

#[tokio::test]
async fn test_clear_all_restarts_from_requested_time() {
    let network = FakeNetwork::new();
    let references = references(6, None);
    let mut prefetch = SegmentPrefetch::new(2, stream(1, &references), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);
    let first = prefetch.get_prefetched_segment(&references[0]).assert_success();

    prefetch.clear_all();
    assert_eq!(prefetch.prefetched_count(), 0);
    assert_eq!(first.status(), FetchStatus::Aborted);

    prefetch.prefetch_segments_by_time(references[4].start_time());
    prefetch.get_prefetched_segment(&references[4]).assert_success();
    prefetch.get_prefetched_segment(&references[5]).assert_success();
    prefetch.get_prefetched_segment(&references[2]).assert_error();
}

#[tokio::test]
async fn test_switch_stream() {
    let network = FakeNetwork::new();
    let references = references(3, None);
    let current = stream(1, &references);
    let mut prefetch = SegmentPrefetch::new(2, current.clone(), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    // Same stream: nothing happens.
    prefetch.switch_stream(current);
    assert_eq!(prefetch.prefetched_count(), 2);

    let other_references = self::references(3, None);
    let other = stream(2, &other_references);
    prefetch.switch_stream(other.clone());
    assert_eq!(prefetch.prefetched_count(), 0);
    assert!(Arc::ptr_eq(prefetch.stream(), &other));

    prefetch.prefetch_segments_by_time(0.);
    prefetch.get_prefetched_segment(&other_references[0]).assert_success();
    prefetch.get_prefetched_segment(&references[0]).assert_error();
}

#[tokio::test]
async fn test_reset_limit() {
    let network = FakeNetwork::new();
    let references = references(4, None);
    let mut prefetch = SegmentPrefetch::new(3, stream(1, &references), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    let kept = prefetch.get_prefetched_segment(&references[0]).assert_success();
    let dropped = prefetch.get_prefetched_segment(&references[2]).assert_success();
    prefetch.reset_limit(1);

    assert_eq!(prefetch.prefetched_count(), 1);
    assert_eq!(kept.status(), FetchStatus::Fetching);
    assert_eq!(dropped.status(), FetchStatus::Aborted);

    // Raising the limit keeps what is tracked.
    prefetch.reset_limit(5);
    assert_eq!(prefetch.limit(), 5);
    assert_eq!(prefetch.prefetched_count(), 1);
}

#[tokio::test]
async fn test_set_reverse_turns_around() {
    let network = FakeNetwork::new();
    let references = references(8, None);
    let mut prefetch = SegmentPrefetch::with_config(
        PrefetchConfig {
            limit: 2,
            reverse: false,
        },
        stream(1, &references),
        network.dispatcher(),
    );

    prefetch.prefetch_segments_by_time(references[4].start_time());
    prefetch.get_prefetched_segment(&references[4]).assert_success();
    prefetch.get_prefetched_segment(&references[5]).assert_success();

    prefetch.set_reverse(true);
    assert!(prefetch.is_reverse());
    // Tracked entries are untouched by the direction change.
    assert_eq!(prefetch.prefetched_count(), 2);

    prefetch.clear_all();
    prefetch.prefetch_segments_by_time(references[4].start_time());
    prefetch.get_prefetched_segment(&references[4]).assert_success();
    prefetch.get_prefetched_segment(&references[3]).assert_success();
    prefetch.get_prefetched_segment(&references[5]).assert_error();
}

#[tokio::test]
async fn test_init_segment_not_counted() -> anyhow::Result<()> {
    let network = FakeNetwork::new();
    let init = Arc::new(InitSegmentReference::new(fixed_uris(Vec::new()), 0, Some(999)));
    let references = references(4, Some(init.clone()));
    let mut prefetch = SegmentPrefetch::new(2, stream(1, &references), network.dispatcher());

    prefetch.prefetch_segments_by_time(0.);
    assert_eq!(network.media_calls(), 2);
    assert_eq!(network.init_calls(), 1);
    assert_eq!(prefetch.prefetched_count(), 2);

    // An equivalent init reference resolves to the same fetch.
    let same_bytes = Arc::new(InitSegmentReference::new(fixed_uris(Vec::new()), 0, Some(999)));
    let operation = prefetch.get_prefetched_init_segment(&same_bytes).assert_success();

    network.release();
    assert_eq!(operation.wait().await?, Bytes::from_static(b"init"));
    Ok(())
}

#[tokio::test]
async fn test_cursor_survives_refresh_listing_evicted_segments() {
    let network = FakeNetwork::new();
    let references = references(3, None);
    let stream = stream(1, &references);
    let mut prefetch = SegmentPrefetch::new(2, stream.clone(), network.dispatcher());
    prefetch.prefetch_segments_by_time(0.);

    stream.segment_index().write().evict(4.);
    prefetch.evict(4.);

    // The refreshed list still starts with the evicted segment.
    let mut refreshed = references.clone();
    refreshed.extend(self::references(4, None).into_iter().skip(3));
    stream.segment_index().write().merge_and_evict(refreshed, 4.);
    assert_eq!(stream.segment_index().read().find(6.), Some(1));
    assert_eq!(stream.segment_index().read().num_evicted(), 1);

    prefetch.prefetch_segments_by_time(4.);
    assert_eq!(network.media_calls(), 3);
    prefetch.get_prefetched_segment(&references[1]).assert_success();
    prefetch.get_prefetched_segment(&references[2]).assert_success();
}
