pub mod correction;
pub mod error;
pub mod fetch;
pub mod index;
pub mod mp4;
pub mod prefetch;
pub mod segment;
pub mod timeline;
pub mod util;

pub use error::{KisekiError, KisekiResult};
pub use index::SegmentIndex;
pub use prefetch::{FetchDispatcher, FetchOperation, FetchStatus, SegmentPrefetch, Stream};
pub use segment::{ContentType, InitSegmentReference, SegmentReference, SegmentStatus};
pub use timeline::PresentationTimeline;
pub use util::http::HttpClient;

/// ┌──────────────────┐  merge / evict   ┌──────────────────┐
/// │                  ├──────────────────►                  │
/// │  Manifest parser │                  │   SegmentIndex   │
/// │                  │   availability   │                  │
/// │                  ├───────┐          └────────┬─────────┘
/// └──────────────────┘       │                   │ find / get
///                   ┌────────▼─────────┐ ┌───────▼──────────┐   dispatch   ┌──────────────┐
///                   │                  │ │                  ├──────────────►              │
///                   │   Presentation   │ │  SegmentPrefetch │              │  Dispatcher  │
///                   │     Timeline     │ │                  ◄──────────────┤              │
///                   │                  │ │                  │    bytes     └──────────────┘
///                   └──────────────────┘ └───────┬──────────┘
///                                                │ FetchOperation::wait
///                                        ┌───────▼──────────┐
///                                        │ TimestampOffset  │
///                                        │    Corrector     │
///                                        └──────────────────┘
pub type SharedTimeline = std::sync::Arc<parking_lot::RwLock<PresentationTimeline>>;
