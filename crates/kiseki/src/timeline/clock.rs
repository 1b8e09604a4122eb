use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of wall-clock time for availability computations.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock which only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// A clock standing at `seconds` after the unix epoch.
    pub fn at_epoch_seconds(seconds: f64) -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + seconds_to_delta(seconds))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds_to_delta(seconds);
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Seconds since the unix epoch, with sub-second precision.
pub(crate) fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.
}

fn seconds_to_delta(seconds: f64) -> TimeDelta {
    TimeDelta::microseconds((seconds * 1_000_000.).round() as i64)
}

/// How far the server clock runs ahead of the local clock, in seconds, given the server time
/// observed during one request.
///
/// ```text
/// <before_request>  (local)
///      <remote_now> (server, assumed to be sampled half way through the round trip)
/// <after_request>   (local)
/// ```
pub fn clock_offset_from_round_trip(
    remote_now: DateTime<Utc>,
    before_request: DateTime<Utc>,
    after_request: DateTime<Utc>,
) -> f64 {
    let half_rtt = (after_request - before_request) / 2;
    let server_now = remote_now + half_rtt;
    let offset = server_now - after_request;
    offset.num_microseconds().unwrap_or_else(|| offset.num_milliseconds() * 1000) as f64
        / 1_000_000.
}
