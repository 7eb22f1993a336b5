//! Fixed-width, time-bucketed counter supporting windowed sum/max.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

/// Default width of a rolling number's window, in one-second buckets.
pub const DEFAULT_WINDOW_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Second offset from the window's epoch that this bucket covers.
    start_sec: u64,
    value: f64,
}

/// A ring of `window_secs` one-second buckets tracking either a running sum or a running max,
/// depending on which write method the caller uses.
///
/// Buckets older than the window are evicted opportunistically on every access, so memory stays
/// O(window_secs) regardless of call volume.
#[derive(Debug)]
pub struct RollingNumber {
    epoch: Instant,
    window_secs: u64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RollingNumber {
    pub fn new(window_secs: u64) -> Self {
        Self {
            epoch: Instant::now(),
            window_secs: window_secs.max(1),
            buckets: Mutex::new(VecDeque::with_capacity(window_secs as usize + 1)),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW_SECS)
    }

    fn sec_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    fn evict_stale(buckets: &mut VecDeque<Bucket>, now_sec: u64, window_secs: u64) {
        let floor = now_sec.saturating_sub(window_secs);
        while let Some(front) = buckets.front() {
            if front.start_sec < floor {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current_bucket<'a>(buckets: &'a mut VecDeque<Bucket>, now_sec: u64) -> &'a mut Bucket {
        if buckets.back().map(|b| b.start_sec) != Some(now_sec) {
            buckets.push_back(Bucket {
                start_sec: now_sec,
                value: 0.0,
            });
        }
        buckets.back_mut().expect("just pushed")
    }

    /// Add `delta` to the bucket for the current second.
    pub fn increment(&self, delta: f64) {
        let now_sec = self.sec_of(Instant::now());
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, now_sec, self.window_secs);
        let bucket = Self::current_bucket(&mut buckets, now_sec);
        bucket.value += delta;
    }

    /// Set the bucket for the current second to `value` if it is larger than what's there.
    pub fn update_max(&self, value: f64) {
        let now_sec = self.sec_of(Instant::now());
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, now_sec, self.window_secs);
        let bucket = Self::current_bucket(&mut buckets, now_sec);
        if value > bucket.value {
            bucket.value = value;
        }
    }

    /// Sum of every bucket whose start second falls within `[now - W, now]`.
    pub fn sum(&self, now: Instant) -> f64 {
        let now_sec = self.sec_of(now);
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, now_sec, self.window_secs);
        buckets.iter().map(|b| b.value).sum()
    }

    /// Maximum value among buckets whose start second falls within `[now - W, now]`.
    pub fn max(&self, now: Instant) -> f64 {
        let now_sec = self.sec_of(now);
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, now_sec, self.window_secs);
        buckets.iter().map(|b| b.value).fold(0.0, f64::max)
    }

    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}
