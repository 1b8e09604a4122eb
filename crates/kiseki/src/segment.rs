use std::{fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use url::Url;

use crate::util::range::ByteRange;

/// Lazily resolves the failover group of equivalent URIs for a segment.
pub type UriResolver = Arc<dyn Fn() -> Vec<Url> + Send + Sync>;

/// A resolver which always yields the same URIs.
pub fn fixed_uris(uris: Vec<Url>) -> UriResolver {
    Arc::new(move || uris.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    #[default]
    Video,
    Audio,
    Text,
}

impl ContentType {
    pub fn from_mime_type(mime_type: Option<&str>) -> Option<Self> {
        let mime_type = mime_type.unwrap_or("video");

        if mime_type.starts_with("video") {
            Some(Self::Video)
        } else if mime_type.starts_with("audio") {
            Some(Self::Audio)
        } else if mime_type.starts_with("text") || mime_type == "application/mp4" {
            Some(Self::Text)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentStatus {
    #[default]
    Available,
    Unavailable,
    Missing,
}

/// Grid of thumbnails packed into one image segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilesLayout {
    pub columns: u32,
    pub rows: u32,
}

impl TilesLayout {
    /// Parses the `<columns>x<rows>` notation used by thumbnail tracks.
    pub fn parse(s: &str) -> Option<Self> {
        let (columns, rows) = s.split_once(['x', 'X'])?;
        let columns = columns.trim().parse().ok()?;
        let rows = rows.trim().parse().ok()?;
        if columns == 0 || rows == 0 {
            return None;
        }
        Some(Self { columns, rows })
    }

    pub fn tile_count(&self) -> u32 {
        self.columns * self.rows
    }
}

/// Segment-level AES-128 key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKey {
    pub key: Bytes,
    pub iv: Option<[u8; 16]>,
    pub first_media_sequence_number: u64,
}

/// Initialization segment shared by every media segment that points at it.
pub struct InitSegmentReference {
    uris: UriResolver,
    start_byte: u64,
    end_byte: Option<u64>,
    /// Pre-supplied bytes, e.g. an init segment synthesized for a format lacking one.
    segment_data: Option<Bytes>,
}

impl InitSegmentReference {
    pub fn new(uris: UriResolver, start_byte: u64, end_byte: Option<u64>) -> Self {
        Self {
            uris,
            start_byte,
            end_byte,
            segment_data: None,
        }
    }

    pub fn with_segment_data(mut self, data: Bytes) -> Self {
        self.segment_data = Some(data);
        self
    }

    pub fn uris(&self) -> Vec<Url> {
        (self.uris)()
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> Option<u64> {
        self.end_byte
    }

    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.start_byte, self.end_byte)
    }

    pub fn segment_data(&self) -> Option<&Bytes> {
        self.segment_data.as_ref()
    }

    /// Two init references naming the same bytes of the same resource.
    pub fn same_resource(&self, other: &InitSegmentReference) -> bool {
        self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
            && self.uris() == other.uris()
    }
}

impl PartialEq for InitSegmentReference {
    fn eq(&self, other: &Self) -> bool {
        self.same_resource(other) && self.segment_data == other.segment_data
    }
}

impl fmt::Debug for InitSegmentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitSegmentReference")
            .field("uris", &self.uris())
            .field("start_byte", &self.start_byte)
            .field("end_byte", &self.end_byte)
            .field("segment_data", &self.segment_data.as_ref().map(|d| d.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MutableState {
    timestamp_offset: f64,
    status: SegmentStatus,
}

/// One fetchable media segment covering `[start_time, end_time)` on the presentation timeline.
///
/// Everything except the timestamp offset and the status is fixed at construction.
pub struct SegmentReference {
    position: Option<u64>,
    start_time: f64,
    end_time: f64,
    uris: UriResolver,
    start_byte: u64,
    end_byte: Option<u64>,
    init_segment_reference: Option<Arc<InitSegmentReference>>,
    append_window_start: f64,
    append_window_end: f64,
    partial_references: Vec<Arc<SegmentReference>>,
    tiles_layout: Option<TilesLayout>,
    tile_duration: Option<f64>,
    sync_time: Option<f64>,
    aes_key: Option<Arc<AesKey>>,
    state: RwLock<MutableState>,
}

impl SegmentReference {
    pub fn new(start_time: f64, end_time: f64, uris: UriResolver) -> Self {
        Self {
            position: None,
            start_time,
            end_time,
            uris,
            start_byte: 0,
            end_byte: None,
            init_segment_reference: None,
            append_window_start: 0.,
            append_window_end: f64::INFINITY,
            partial_references: Vec::new(),
            tiles_layout: None,
            tile_duration: None,
            sync_time: None,
            aes_key: None,
            state: RwLock::new(MutableState {
                timestamp_offset: 0.,
                status: SegmentStatus::Available,
            }),
        }
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_byte_range(mut self, start_byte: u64, end_byte: Option<u64>) -> Self {
        self.start_byte = start_byte;
        self.end_byte = end_byte;
        self
    }

    pub fn with_init_segment(mut self, init: Arc<InitSegmentReference>) -> Self {
        self.init_segment_reference = Some(init);
        self
    }

    pub fn with_timestamp_offset(self, timestamp_offset: f64) -> Self {
        self.state.write().timestamp_offset = timestamp_offset;
        self
    }

    pub fn with_append_window(mut self, start: f64, end: f64) -> Self {
        self.append_window_start = start;
        self.append_window_end = end;
        self
    }

    pub fn with_partial_references(mut self, partials: Vec<Arc<SegmentReference>>) -> Self {
        self.partial_references = partials;
        self
    }

    pub fn with_tiles(mut self, layout: TilesLayout, tile_duration: Option<f64>) -> Self {
        self.tiles_layout = Some(layout);
        self.tile_duration = tile_duration;
        self
    }

    pub fn with_sync_time(mut self, sync_time: f64) -> Self {
        self.sync_time = Some(sync_time);
        self
    }

    pub fn with_status(self, status: SegmentStatus) -> Self {
        self.state.write().status = status;
        self
    }

    pub fn with_aes_key(mut self, key: Arc<AesKey>) -> Self {
        self.aes_key = Some(key);
        self
    }

    /// A copy of this reference ending at `end_time` instead.
    pub fn with_end_time(&self, end_time: f64) -> Self {
        let mut reference = self.clone();
        reference.end_time = end_time;
        reference
    }

    pub(crate) fn set_position(&mut self, position: u64) {
        self.position = Some(position);
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn uris(&self) -> Vec<Url> {
        (self.uris)()
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> Option<u64> {
        self.end_byte
    }

    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.start_byte, self.end_byte)
    }

    pub fn init_segment_reference(&self) -> Option<&Arc<InitSegmentReference>> {
        self.init_segment_reference.as_ref()
    }

    pub fn append_window_start(&self) -> f64 {
        self.append_window_start
    }

    pub fn append_window_end(&self) -> f64 {
        self.append_window_end
    }

    pub fn partial_references(&self) -> &[Arc<SegmentReference>] {
        &self.partial_references
    }

    pub fn has_partial_references(&self) -> bool {
        !self.partial_references.is_empty()
    }

    pub fn tiles_layout(&self) -> Option<TilesLayout> {
        self.tiles_layout
    }

    pub fn tile_duration(&self) -> Option<f64> {
        self.tile_duration
    }

    pub fn sync_time(&self) -> Option<f64> {
        self.sync_time
    }

    pub fn aes_key(&self) -> Option<&Arc<AesKey>> {
        self.aes_key.as_ref()
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.state.read().timestamp_offset
    }

    pub fn set_timestamp_offset(&self, timestamp_offset: f64) {
        self.state.write().timestamp_offset = timestamp_offset;
    }

    pub fn status(&self) -> SegmentStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: SegmentStatus) {
        self.state.write().status = status;
    }

    pub fn is_available(&self) -> bool {
        self.status() == SegmentStatus::Available
    }

    /// Whether `time` falls inside `[start_time, end_time)`.
    pub fn contains(&self, time: f64) -> bool {
        self.start_time <= time && time < self.end_time
    }
}

impl Clone for SegmentReference {
    fn clone(&self) -> Self {
        Self {
            position: self.position,
            start_time: self.start_time,
            end_time: self.end_time,
            uris: self.uris.clone(),
            start_byte: self.start_byte,
            end_byte: self.end_byte,
            init_segment_reference: self.init_segment_reference.clone(),
            append_window_start: self.append_window_start,
            append_window_end: self.append_window_end,
            partial_references: self.partial_references.clone(),
            tiles_layout: self.tiles_layout,
            tile_duration: self.tile_duration,
            sync_time: self.sync_time,
            aes_key: self.aes_key.clone(),
            state: RwLock::new(*self.state.read()),
        }
    }
}

impl PartialEq for SegmentReference {
    fn eq(&self, other: &Self) -> bool {
        let init_eq = match (&self.init_segment_reference, &other.init_segment_reference) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
            (None, None) => true,
            _ => false,
        };

        self.position == other.position
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
            && init_eq
            && self.append_window_start == other.append_window_start
            && self.append_window_end == other.append_window_end
            && self.tiles_layout == other.tiles_layout
            && self.tile_duration == other.tile_duration
            && self.sync_time == other.sync_time
            && self.aes_key == other.aes_key
            && *self.state.read() == *other.state.read()
            && self.partial_references.len() == other.partial_references.len()
            && self
                .partial_references
                .iter()
                .zip(other.partial_references.iter())
                .all(|(a, b)| a == b)
            && self.uris() == other.uris()
    }
}

impl fmt::Debug for SegmentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.read();
        f.debug_struct("SegmentReference")
            .field("position", &self.position)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("uris", &self.uris())
            .field("start_byte", &self.start_byte)
            .field("end_byte", &self.end_byte)
            .field("init_segment_reference", &self.init_segment_reference)
            .field("timestamp_offset", &state.timestamp_offset)
            .field("status", &state.status)
            .finish_non_exhaustive()
    }
}
