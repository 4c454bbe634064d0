// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Rate of samples (hashes) within a sliding time window
//!
//! Samples are summed in buckets one interval long. The rate is measured from the current
//! bucket blended with the tail of the previous one, so it moves smoothly when a bucket is
//! rolled over instead of dropping to zero.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct SlidingRate {
    /// Length of one bucket in seconds
    interval: f64,
    /// Start of the current bucket
    bucket_start: Option<Instant>,
    /// Sum of samples in the current bucket
    current: f64,
    /// Rate of the previous bucket (per interval)
    previous: Option<f64>,
}

impl SlidingRate {
    pub fn new(interval: Duration) -> Self {
        assert!(interval.as_secs_f64() > 0.0, "BUG: zero rate interval");
        Self {
            interval: interval.as_secs_f64(),
            bucket_start: None,
            current: 0.0,
            previous: None,
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    fn elapsed(start: Instant, now: Instant) -> f64 {
        now.checked_duration_since(start)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Start a new bucket when the current one is full
    fn roll(&mut self, now: Instant) {
        let start = match self.bucket_start {
            None => {
                self.bucket_start = Some(now);
                return;
            }
            Some(start) => start,
        };
        let elapsed = Self::elapsed(start, now);
        if elapsed < self.interval {
            return;
        }
        // a bucket older than one interval before now doesn't say anything about the present
        self.previous = Some(if elapsed < 2.0 * self.interval {
            self.current / elapsed * self.interval
        } else {
            0.0
        });
        self.bucket_start = Some(now);
        self.current = 0.0;
    }

    /// Account sample at given time. Samples from the past are accounted to the current bucket.
    pub fn insert(&mut self, sample: f64, now: Instant) {
        self.roll(now);
        self.current += sample;
    }

    /// Measure rate (sum of samples per second) at given time
    pub fn measure(&self, now: Instant) -> f64 {
        let start = match self.bucket_start {
            None => return 0.0,
            Some(start) => start,
        };
        let elapsed = Self::elapsed(start, now);
        if elapsed >= 2.0 * self.interval {
            return 0.0;
        }
        match self.previous {
            _ if elapsed >= self.interval => self.current / elapsed,
            None if elapsed == 0.0 => 0.0,
            None => self.current / elapsed,
            Some(previous) => {
                // how far we are into the current bucket, < 1
                let distance = elapsed / self.interval;
                (self.current + previous * (1.0 - distance)) / self.interval
            }
        }
    }
}
