//! Global mean response time: a rolling average over a fixed window.
//!
//! The router measures how long peers take to answer and keeps an average
//! over the last [`GMRT_SECONDS`](crate::GMRT_SECONDS) seconds, one bucket
//! per second. The average seeds the per-request timeout (twice the mean)
//! and the response-time ratio used for reach attribution.

use std::collections::VecDeque;

/// One second of accumulated samples.
#[derive(Clone, Debug)]
struct Bucket {
    /// The second this bucket covers (milliseconds / 1000).
    second: u64,
    sum: u64,
    count: u64,
}

/// Rolling average of u32 samples over a sliding window of whole seconds.
///
/// Clock values are milliseconds from an arbitrary epoch chosen at
/// startup; they must be monotone across calls.
#[derive(Clone, Debug)]
pub struct AverageRoller {
    window_seconds: u64,
    buckets: VecDeque<Bucket>,
    sum: u64,
    count: u64,
    mean: u32,
}

impl AverageRoller {
    /// Create a roller seeded with one initial sample at time zero.
    pub fn new(window_seconds: u64, initial_sample: u32) -> Self {
        let mut roller = AverageRoller {
            window_seconds,
            buckets: VecDeque::new(),
            sum: 0,
            count: 0,
            mean: initial_sample,
        };
        roller.update(0, initial_sample);
        roller
    }

    /// Fold in a sample and return the new mean.
    pub fn update(&mut self, now_ms: u64, sample: u32) -> u32 {
        let second = now_ms / 1000;

        while let Some(front) = self.buckets.front() {
            if front.second + self.window_seconds > second {
                break;
            }
            self.sum -= front.sum;
            self.count -= front.count;
            self.buckets.pop_front();
        }

        match self.buckets.back_mut() {
            Some(back) if back.second == second => {
                back.sum += u64::from(sample);
                back.count += 1;
            }
            _ => self.buckets.push_back(Bucket {
                second,
                sum: u64::from(sample),
                count: 1,
            }),
        }
        self.sum += u64::from(sample);
        self.count += 1;

        // count is at least 1 here; the mean survives an emptied window.
        self.mean = (self.sum / self.count) as u32;
        self.mean
    }

    /// The current mean without folding in a sample.
    pub fn get(&self) -> u32 {
        self.mean
    }
}

/// Map an observed reply latency to `[0, u32::MAX]` relative to the
/// global mean response time.
///
/// A latency above twice the mean rates `u32::MAX` — indistinguishable
/// from dead. A latency equal to the mean rates half of `u32::MAX`, and
/// zero latency rates zero.
pub fn response_time_ratio(gmrt: u32, response_time_ms: u32) -> u32 {
    let gmrt = gmrt.max(1);
    if u64::from(response_time_ms) > 2 * u64::from(gmrt) {
        return u32::MAX;
    }
    let scaled = u64::from((u32::MAX / 2) / gmrt) * u64::from(response_time_ms);
    scaled.min(u64::from(u32::MAX)) as u32
}
