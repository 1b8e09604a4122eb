mod operation;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

pub use operation::{FetchOperation, FetchStatus};

use crate::{
    error::KisekiResult,
    index::SegmentIndex,
    segment::{ContentType, InitSegmentReference, SegmentReference},
    util::range::ByteRange,
};

pub type SharedSegmentIndex = Arc<RwLock<SegmentIndex>>;

/// What a dispatcher is asked to fetch.
#[derive(Debug, Clone)]
pub enum FetchTarget {
    Media(Arc<SegmentReference>),
    Init(Arc<InitSegmentReference>),
}

impl FetchTarget {
    pub fn uris(&self) -> Vec<Url> {
        match self {
            Self::Media(reference) => reference.uris(),
            Self::Init(reference) => reference.uris(),
        }
    }

    pub fn byte_range(&self) -> ByteRange {
        match self {
            Self::Media(reference) => reference.byte_range(),
            Self::Init(reference) => reference.byte_range(),
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self, Self::Init(_))
    }
}

/// Starts fetching one target of one stream. Dropping the returned future cancels the fetch.
pub type FetchDispatcher =
    Arc<dyn Fn(FetchTarget, Arc<Stream>) -> BoxFuture<'static, KisekiResult<Bytes>> + Send + Sync>;

/// One audio, video or text rendition and the index of its segments.
#[derive(Debug)]
pub struct Stream {
    pub id: u64,
    pub content_type: ContentType,
    pub mime_type: Option<String>,
    pub bandwidth: Option<u64>,
    segment_index: SharedSegmentIndex,
}

impl Stream {
    pub fn new(id: u64, content_type: ContentType, segment_index: SegmentIndex) -> Self {
        Self {
            id,
            content_type,
            mime_type: None,
            bandwidth: None,
            segment_index: Arc::new(RwLock::new(segment_index)),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn segment_index(&self) -> &SharedSegmentIndex {
        &self.segment_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Media segments kept fetching or fetched ahead of playback.
    pub limit: usize,
    pub reverse: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            limit: 2,
            reverse: false,
        }
    }
}

struct MediaEntry {
    reference: Arc<SegmentReference>,
    position: u64,
    operation: FetchOperation,
}

struct InitEntry {
    reference: Arc<InitSegmentReference>,
    operation: FetchOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Start from the requested time on the next call.
    Unset,
    /// Next position to visit.
    Next(u64),
    /// Walked past the first position in reverse.
    Exhausted,
}

/// Keeps up to `limit` media segments of one stream fetching ahead of playback.
///
/// Must be used from within a tokio runtime: every dispatched fetch is spawned as its own task.
pub struct SegmentPrefetch {
    limit: usize,
    reverse: bool,
    stream: Arc<Stream>,
    dispatcher: FetchDispatcher,
    /// In dispatch order.
    media: Vec<MediaEntry>,
    inits: Vec<InitEntry>,
    cursor: Cursor,
}

impl SegmentPrefetch {
    pub fn new(limit: usize, stream: Arc<Stream>, dispatcher: FetchDispatcher) -> Self {
        Self {
            limit,
            reverse: false,
            stream,
            dispatcher,
            media: Vec::new(),
            inits: Vec::new(),
            cursor: Cursor::Unset,
        }
    }

    pub fn with_config(
        config: PrefetchConfig,
        stream: Arc<Stream>,
        dispatcher: FetchDispatcher,
    ) -> Self {
        let mut prefetch = Self::new(config.limit, stream, dispatcher);
        prefetch.reverse = config.reverse;
        prefetch
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Number of tracked media segments, fetching or fetched.
    pub fn prefetched_count(&self) -> usize {
        self.media.len()
    }

    /// Dispatches fetches for references at or after `time` (before it, in reverse) until
    /// `limit` media segments are tracked. Repeated calls resume where the previous one stopped.
    pub fn prefetch_segments_by_time(&mut self, time: f64) {
        let stream = self.stream.clone();
        let index = stream.segment_index.read();

        let mut position = match self.cursor {
            Cursor::Unset => match index.find(time) {
                Some(position) => position,
                None => {
                    tracing::trace!(stream = stream.id, time, "No segment to prefetch");
                    return;
                }
            },
            Cursor::Next(position) => position,
            Cursor::Exhausted => return,
        };
        if !self.reverse {
            if let Some(first) = index.first_position() {
                position = position.max(first);
            }
        }

        loop {
            self.cursor = Cursor::Next(position);
            if self.media.len() >= self.limit {
                break;
            }
            let Some(reference) = index.get(position).cloned() else {
                break;
            };

            if !reference.is_available() {
                tracing::debug!(
                    stream = stream.id,
                    position,
                    status = ?reference.status(),
                    "Skipping unavailable segment"
                );
            } else if !self.is_tracked(&reference) {
                self.dispatch(reference, position);
            }

            match self.step(position) {
                Some(next) => position = next,
                None => {
                    self.cursor = Cursor::Exhausted;
                    break;
                }
            }
        }
    }

    pub fn get_prefetched_segment(
        &self,
        reference: &Arc<SegmentReference>,
    ) -> Option<FetchOperation> {
        self.media
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.reference, reference))
            .map(|entry| entry.operation.clone())
    }

    pub fn get_prefetched_init_segment(
        &self,
        reference: &Arc<InitSegmentReference>,
    ) -> Option<FetchOperation> {
        self.find_init(reference).map(|entry| entry.operation.clone())
    }

    /// Drops tracked segments ending at or before `time`, aborting pending fetches.
    pub fn evict(&mut self, time: f64) {
        let before = self.media.len();
        self.media.retain(|entry| {
            let keep = entry.reference.end_time() > time;
            if !keep {
                entry.operation.abort();
            }
            keep
        });

        if self.media.len() != before {
            tracing::debug!(
                stream = self.stream.id,
                evicted = before - self.media.len(),
                time,
                "Evicted prefetched segments"
            );
            self.release_unused_inits();
        }
    }

    /// Aborts and forgets everything; the next prefetch starts over from its requested time.
    pub fn clear_all(&mut self) {
        for entry in self.media.drain(..) {
            entry.operation.abort();
        }
        for entry in self.inits.drain(..) {
            entry.operation.abort();
        }
        self.cursor = Cursor::Unset;
        tracing::debug!(stream = self.stream.id, "Cleared prefetched segments");
    }

    pub fn switch_stream(&mut self, stream: Arc<Stream>) {
        if Arc::ptr_eq(&self.stream, &stream) {
            return;
        }
        self.clear_all();
        tracing::debug!(from = self.stream.id, to = stream.id, "Switching prefetch stream");
        self.stream = stream;
    }

    pub fn set_reverse(&mut self, reverse: bool) {
        if self.reverse == reverse {
            return;
        }
        self.reverse = reverse;

        // Turn around on the last visited position.
        self.cursor = match self.cursor {
            Cursor::Unset => Cursor::Unset,
            Cursor::Exhausted => Cursor::Next(1),
            Cursor::Next(next) if reverse => {
                next.checked_sub(2).map_or(Cursor::Exhausted, Cursor::Next)
            }
            Cursor::Next(next) => Cursor::Next(next + 2),
        };
    }

    /// Lowers the limit, aborting the most recently dispatched segments beyond it. Raising the
    /// limit keeps every tracked segment.
    pub fn reset_limit(&mut self, limit: usize) {
        if limit >= self.limit {
            self.limit = limit;
            return;
        }
        self.limit = limit;
        if self.media.len() <= limit {
            return;
        }

        let dropped = self.media.split_off(limit);
        for entry in &dropped {
            entry.operation.abort();
        }
        if let Some(first) = dropped.first() {
            // Revisit the dropped references once there is room again.
            self.cursor = Cursor::Next(first.position);
        }
        tracing::debug!(
            stream = self.stream.id,
            limit,
            dropped = dropped.len(),
            "Reduced prefetch limit"
        );
        self.release_unused_inits();
    }

    fn step(&self, position: u64) -> Option<u64> {
        if self.reverse {
            position.checked_sub(1)
        } else {
            position.checked_add(1)
        }
    }

    fn is_tracked(&self, reference: &Arc<SegmentReference>) -> bool {
        self.media
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.reference, reference))
    }

    fn find_init(&self, reference: &Arc<InitSegmentReference>) -> Option<&InitEntry> {
        self.inits.iter().find(|entry| {
            Arc::ptr_eq(&entry.reference, reference) || entry.reference.same_resource(reference)
        })
    }

    fn dispatch(&mut self, reference: Arc<SegmentReference>, position: u64) {
        if let Some(init) = reference.init_segment_reference() {
            if self.find_init(init).is_none() {
                tracing::debug!(stream = self.stream.id, "Prefetching init segment");
                let operation = FetchOperation::spawn((self.dispatcher)(
                    FetchTarget::Init(init.clone()),
                    self.stream.clone(),
                ));
                self.inits.push(InitEntry {
                    reference: init.clone(),
                    operation,
                });
            }
        }

        tracing::debug!(
            stream = self.stream.id,
            position,
            start = reference.start_time(),
            end = reference.end_time(),
            "Prefetching segment"
        );
        let operation = FetchOperation::spawn((self.dispatcher)(
            FetchTarget::Media(reference.clone()),
            self.stream.clone(),
        ));
        self.media.push(MediaEntry {
            reference,
            position,
            operation,
        });
    }

    /// Releases init segments no tracked media segment needs, keeping the latest one around for
    /// the segments that follow.
    fn release_unused_inits(&mut self) {
        let Some(latest) = self.inits.last().map(|entry| entry.reference.clone()) else {
            return;
        };

        let media = &self.media;
        self.inits.retain(|entry| {
            let in_use = Arc::ptr_eq(&entry.reference, &latest)
                || media.iter().any(|m| {
                    m.reference.init_segment_reference().is_some_and(|init| {
                        Arc::ptr_eq(init, &entry.reference) || init.same_resource(&entry.reference)
                    })
                });
            if !in_use {
                entry.operation.abort();
            }
            in_use
        });
    }
}

impl Drop for SegmentPrefetch {
    fn drop(&mut self) {
        self.clear_all();
    }
}
