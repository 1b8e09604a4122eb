//! Presentation timeline and live availability window.
//!
//! All values are seconds. For live presentations the window is derived from the wall clock:
//!
//! ```text
//! elapsed = now + clock_offset - presentation_start_time
//! end     = min(duration, floor(elapsed / max_segment_duration) * max_segment_duration)
//! start   = max(0, end - segment_availability_duration)
//! ```
//!
//! Infinite `duration` and `segment_availability_duration` are legal and follow normal IEEE
//! arithmetic.
mod clock;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use clock::{clock_offset_from_round_trip, ManualClock, SystemClock, WallClock};

use crate::segment::SegmentReference;

const DEFAULT_MAX_SEGMENT_DURATION: f64 = 1.;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvailabilityWindow {
    pub start: f64,
    pub end: f64,
}

impl AvailabilityWindow {
    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.)
    }
}

pub struct PresentationTimeline {
    duration: f64,
    /// Wall-clock epoch seconds at which the presentation began, `None` for VOD.
    presentation_start_time: Option<f64>,
    segment_availability_duration: f64,
    max_segment_duration: f64,
    /// Seconds the server clock runs ahead of the local clock.
    clock_offset: f64,
    presentation_delay: f64,
    user_seek_start: f64,
    /// Set once a live presentation has ended.
    is_static: bool,
    clock: Arc<dyn WallClock>,
}

impl PresentationTimeline {
    pub fn new(presentation_start_time: Option<f64>, presentation_delay: f64) -> Self {
        Self {
            duration: f64::INFINITY,
            presentation_start_time,
            segment_availability_duration: f64::INFINITY,
            max_segment_duration: DEFAULT_MAX_SEGMENT_DURATION,
            clock_offset: 0.,
            presentation_delay,
            user_seek_start: 0.,
            is_static: false,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn vod(duration: f64) -> Self {
        let mut timeline = Self::new(None, 0.);
        timeline.set_duration(duration);
        timeline
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_live(&self) -> bool {
        self.presentation_start_time.is_some() && !self.is_static
    }

    pub fn is_static(&self) -> bool {
        self.is_static || self.presentation_start_time.is_none()
    }

    /// Marks a live presentation as finished: the window stops following the wall clock.
    pub fn set_static(&mut self, is_static: bool) {
        self.is_static = is_static;
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        if duration.is_nan() || duration < 0. {
            tracing::warn!(duration, "Ignoring invalid presentation duration");
            return;
        }
        self.duration = duration;
    }

    pub fn presentation_start_time(&self) -> Option<f64> {
        self.presentation_start_time
    }

    pub fn set_presentation_start_time(&mut self, start: Option<f64>) {
        self.presentation_start_time = start;
    }

    pub fn segment_availability_duration(&self) -> f64 {
        self.segment_availability_duration
    }

    pub fn set_segment_availability_duration(&mut self, duration: f64) {
        self.segment_availability_duration = duration;
    }

    pub fn max_segment_duration(&self) -> f64 {
        self.max_segment_duration
    }

    /// Raises the max segment duration, never lowers it.
    pub fn notify_max_segment_duration(&mut self, duration: f64) {
        if duration > self.max_segment_duration {
            self.max_segment_duration = duration;
        }
    }

    pub fn notify_segments(&mut self, references: &[Arc<SegmentReference>]) {
        for reference in references {
            self.notify_max_segment_duration(reference.duration());
        }
    }

    pub fn reset_max_segment_duration(&mut self) {
        self.max_segment_duration = DEFAULT_MAX_SEGMENT_DURATION;
    }

    pub fn clock_offset(&self) -> f64 {
        self.clock_offset
    }

    pub fn set_clock_offset(&mut self, offset: f64) {
        self.clock_offset = offset;
    }

    /// Derives the clock offset from a server time sampled between two local instants.
    pub fn sync_clock(
        &mut self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        self.clock_offset =
            clock_offset_from_round_trip(remote_now, before_request, after_request);
        tracing::info!(
            offset_seconds = self.clock_offset,
            "Clock time set to {remote_now}, offset calculated"
        );
    }

    pub fn presentation_delay(&self) -> f64 {
        self.presentation_delay
    }

    pub fn set_presentation_delay(&mut self, delay: f64) {
        self.presentation_delay = delay;
    }

    pub fn user_seek_start(&self) -> f64 {
        self.user_seek_start
    }

    pub fn set_user_seek_start(&mut self, start: f64) {
        self.user_seek_start = start;
    }

    fn live_edge(&self) -> f64 {
        let Some(start) = self.presentation_start_time else {
            return self.duration;
        };
        let now = clock::epoch_seconds(self.clock.now());
        let elapsed = now + self.clock_offset - start;
        granularize(elapsed, self.max_segment_duration).max(0.)
    }

    pub fn segment_availability_end(&self) -> f64 {
        if !self.is_live() {
            return self.duration;
        }
        self.live_edge().min(self.duration)
    }

    pub fn segment_availability_start(&self) -> f64 {
        self.availability_window().start
    }

    pub fn availability_window(&self) -> AvailabilityWindow {
        if !self.is_live() {
            return AvailabilityWindow {
                start: 0.,
                end: self.duration,
            };
        }

        let end = self.segment_availability_end();
        let start = (end - self.segment_availability_duration).max(0.);
        AvailabilityWindow { start, end }
    }

    pub fn is_time_available(&self, time: f64) -> bool {
        self.availability_window().contains(time)
    }

    pub fn seek_range_start(&self) -> f64 {
        self.segment_availability_start().max(self.user_seek_start)
    }

    /// The latest time playback should target, keeping `presentation_delay` behind the edge.
    pub fn seek_range_end(&self) -> f64 {
        let window = self.availability_window();
        if !self.is_live() {
            return window.end;
        }
        let start = window.start.max(self.user_seek_start);
        (window.end - self.presentation_delay).max(start)
    }
}

impl std::fmt::Debug for PresentationTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationTimeline")
            .field("duration", &self.duration)
            .field("presentation_start_time", &self.presentation_start_time)
            .field(
                "segment_availability_duration",
                &self.segment_availability_duration,
            )
            .field("max_segment_duration", &self.max_segment_duration)
            .field("clock_offset", &self.clock_offset)
            .field("presentation_delay", &self.presentation_delay)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

/// Floors `time` to a multiple of `granularity`.
fn granularize(time: f64, granularity: f64) -> f64 {
    if granularity > 0. && granularity.is_finite() && time.is_finite() {
        (time / granularity).floor() * granularity
    } else {
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(start: f64, now: f64) -> (PresentationTimeline, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_seconds(now));
        let timeline = PresentationTimeline::new(Some(start), 0.).with_clock(clock.clone());
        (timeline, clock)
    }

    #[test]
    fn test_vod_window() {
        let timeline = PresentationTimeline::vod(60.);
        assert!(!timeline.is_live());
        assert_eq!(timeline.segment_availability_start(), 0.);
        assert_eq!(timeline.segment_availability_end(), 60.);
    }

    #[test]
    fn test_vod_ignores_wall_clock() {
        let clock = Arc::new(ManualClock::at_epoch_seconds(1000.));
        let timeline = PresentationTimeline::vod(60.).with_clock(clock.clone());
        clock.advance(3600.);
        assert_eq!(
            timeline.availability_window(),
            AvailabilityWindow { start: 0., end: 60. }
        );
    }

    #[test]
    fn test_live_window_follows_clock() {
        let (mut timeline, clock) = live(1000., 1100.);
        timeline.set_segment_availability_duration(30.);
        timeline.notify_max_segment_duration(10.);

        assert_eq!(timeline.segment_availability_end(), 100.);
        assert_eq!(timeline.segment_availability_start(), 70.);

        // Window only moves in whole max-segment-duration steps.
        clock.advance(9.);
        assert_eq!(timeline.segment_availability_end(), 100.);
        clock.advance(1.);
        assert_eq!(timeline.segment_availability_end(), 110.);
        assert_eq!(timeline.segment_availability_start(), 80.);
    }

    #[test]
    fn test_live_infinite_availability_duration() {
        let (timeline, _clock) = live(1000., 1500.);
        assert_eq!(timeline.segment_availability_start(), 0.);
        assert_eq!(timeline.segment_availability_end(), 500.);
    }

    #[test]
    fn test_live_end_clamped_to_duration() {
        let (mut timeline, clock) = live(1000., 1050.);
        timeline.set_duration(60.);
        timeline.set_segment_availability_duration(20.);

        assert_eq!(timeline.segment_availability_end(), 50.);
        clock.advance(100.);
        assert_eq!(timeline.segment_availability_end(), 60.);
        assert_eq!(timeline.segment_availability_start(), 40.);
    }

    #[test]
    fn test_live_before_start() {
        let (timeline, _clock) = live(1000., 900.);
        assert_eq!(timeline.segment_availability_end(), 0.);
        assert_eq!(timeline.segment_availability_start(), 0.);
    }

    #[test]
    fn test_clock_offset_shifts_window() {
        let (mut timeline, _clock) = live(1000., 1100.);
        timeline.set_clock_offset(10.);
        assert_eq!(timeline.segment_availability_end(), 110.);
    }

    #[test]
    fn test_max_segment_duration_never_decreases() {
        let mut timeline = PresentationTimeline::vod(10.);
        timeline.notify_max_segment_duration(4.);
        timeline.notify_max_segment_duration(2.);
        assert_eq!(timeline.max_segment_duration(), 4.);

        timeline.reset_max_segment_duration();
        assert_eq!(timeline.max_segment_duration(), DEFAULT_MAX_SEGMENT_DURATION);
    }

    #[test]
    fn test_static_live_behaves_as_vod() {
        let (mut timeline, _clock) = live(1000., 1100.);
        timeline.set_duration(80.);
        timeline.set_static(true);
        assert!(!timeline.is_live());
        assert_eq!(timeline.segment_availability_end(), 80.);
    }

    #[test]
    fn test_start_time_set_later_turns_live() {
        let clock = Arc::new(ManualClock::at_epoch_seconds(1100.));
        let mut timeline = PresentationTimeline::new(None, 0.).with_clock(clock);
        timeline.set_segment_availability_duration(30.);
        assert!(!timeline.is_live());
        assert!(timeline.is_static());

        timeline.set_presentation_start_time(Some(1000.));
        assert!(timeline.is_live());
        assert!(!timeline.is_static());
        assert_eq!(
            timeline.availability_window(),
            AvailabilityWindow {
                start: 70.,
                end: 100.
            }
        );

        timeline.set_presentation_start_time(None);
        assert!(!timeline.is_live());
    }

    #[test]
    fn test_seek_range_end_keeps_delay() {
        let (mut timeline, _clock) = live(1000., 1100.);
        timeline.set_presentation_delay(6.);
        assert_eq!(timeline.seek_range_end(), 94.);

        timeline.set_presentation_delay(500.);
        assert_eq!(timeline.seek_range_end(), 0.);
    }

    #[test]
    fn test_set_duration_rejects_nan() {
        let mut timeline = PresentationTimeline::vod(10.);
        timeline.set_duration(f64::NAN);
        assert_eq!(timeline.duration(), 10.);
        timeline.set_duration(f64::INFINITY);
        assert_eq!(timeline.duration(), f64::INFINITY);
    }
}
