// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Sliding traffic window.
//!
//! Counters land in 200 ms buckets kept for five seconds. Aggregation folds
//! the buckets into one-second windows and weighs them with an exponential
//! roll-off, so a burst two seconds ago still shows but barely moves the
//! needle.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use time;

pub const BUCKET_WIDTH: Duration = Duration::from_millis(200);
pub const WINDOW_HORIZON: Duration = Duration::from_secs(5);
pub const ROLL_OFF: f64 = 0.3;

#[derive(Debug)]
pub struct StatBucket {
    start: Instant,
    /// Wall-clock second the bucket was opened at, for the debug dump.
    pub wall_sec: i64,
    pub meta_msgs_sent: u64,
    pub meta_bytes_sent: u64,
    pub meta_msgs_rcvd: u64,
    pub meta_bytes_rcvd: u64,
    pub chan_msgs_sent: HashMap<String, u64>,
    pub chan_bytes_sent: HashMap<String, u64>,
    pub chan_msgs_rcvd: HashMap<String, u64>,
    pub chan_bytes_rcvd: HashMap<String, u64>,
}

impl StatBucket {
    fn new(now: Instant) -> StatBucket {
        StatBucket {
            start: now,
            wall_sec: time::get_time().sec,
            meta_msgs_sent: 0,
            meta_bytes_sent: 0,
            meta_msgs_rcvd: 0,
            meta_bytes_rcvd: 0,
            chan_msgs_sent: HashMap::new(),
            chan_bytes_sent: HashMap::new(),
            chan_msgs_rcvd: HashMap::new(),
            chan_bytes_rcvd: HashMap::new(),
        }
    }
}

/// Weighted per-second traffic rates, the aggregation of a window.
#[derive(Debug, Default, PartialEq)]
pub struct Rates {
    pub meta_msgs_sent: f64,
    pub meta_bytes_sent: f64,
    pub meta_msgs_rcvd: f64,
    pub meta_bytes_rcvd: f64,
    pub chan_msgs: HashMap<String, f64>,
    pub chan_bytes: HashMap<String, f64>,
}

pub struct StatWindow {
    buckets: VecDeque<StatBucket>,
}

impl StatWindow {
    pub fn new() -> StatWindow {
        StatWindow { buckets: VecDeque::new() }
    }

    /// Evict buckets beyond the horizon and open a fresh one when the current
    /// bucket is full. Runs once per loop iteration.
    pub fn advance(&mut self, now: Instant) {
        while self.buckets.front().map_or(false, |b| now.duration_since(b.start) > WINDOW_HORIZON) {
            self.buckets.pop_front();
        }
        let need_fresh = self.buckets.back().map_or(true, |b| now.duration_since(b.start) >= BUCKET_WIDTH);
        if need_fresh {
            self.buckets.push_back(StatBucket::new(now));
        }
    }

    fn current(&mut self) -> &mut StatBucket {
        if self.buckets.is_empty() {
            let now = Instant::now();
            self.buckets.push_back(StatBucket::new(now));
        }
        self.buckets.back_mut().unwrap()
    }

    pub fn meta_sent(&mut self, bytes: usize) {
        let bucket = self.current();
        bucket.meta_msgs_sent += 1;
        bucket.meta_bytes_sent += bytes as u64;
    }

    pub fn meta_rcvd(&mut self, bytes: usize) {
        let bucket = self.current();
        bucket.meta_msgs_rcvd += 1;
        bucket.meta_bytes_rcvd += bytes as u64;
    }

    pub fn data_sent(&mut self, channel: &str, bytes: usize) {
        let bucket = self.current();
        *bucket.chan_msgs_sent.entry(channel.to_string()).or_insert(0) += 1;
        *bucket.chan_bytes_sent.entry(channel.to_string()).or_insert(0) += bytes as u64;
    }

    pub fn data_rcvd(&mut self, channel: &str, bytes: usize) {
        let bucket = self.current();
        *bucket.chan_msgs_rcvd.entry(channel.to_string()).or_insert(0) += 1;
        *bucket.chan_bytes_rcvd.entry(channel.to_string()).or_insert(0) += bytes as u64;
    }

    /// Fold buckets into one-second windows by age and weigh window `i`
    /// with `ROLL_OFF^i`, normalized over the windows present.
    pub fn rates(&self, now: Instant) -> Rates {
        let mut windows: [Option<StatBucket>; 5] = [None, None, None, None, None];
        let mut rates = Rates::default();

        for bucket in &self.buckets {
            let age = now.duration_since(bucket.start).as_secs() as usize;
            if age >= windows.len() {
                continue;
            }
            let slot = windows[age].get_or_insert_with(|| StatBucket::new(bucket.start));
            slot.meta_msgs_sent += bucket.meta_msgs_sent;
            slot.meta_bytes_sent += bucket.meta_bytes_sent;
            slot.meta_msgs_rcvd += bucket.meta_msgs_rcvd;
            slot.meta_bytes_rcvd += bucket.meta_bytes_rcvd;
            for (chan, count) in &bucket.chan_msgs_sent {
                *slot.chan_msgs_sent.entry(chan.clone()).or_insert(0) += *count;
            }
            for (chan, bytes) in &bucket.chan_bytes_sent {
                *slot.chan_bytes_sent.entry(chan.clone()).or_insert(0) += *bytes;
            }
            for (chan, count) in &bucket.chan_msgs_rcvd {
                *slot.chan_msgs_rcvd.entry(chan.clone()).or_insert(0) += *count;
            }
            for (chan, bytes) in &bucket.chan_bytes_rcvd {
                *slot.chan_bytes_rcvd.entry(chan.clone()).or_insert(0) += *bytes;
            }
        }

        let mut total_weight = 0.0;
        let mut weight = 1.0;
        for window in windows.iter() {
            if let Some(ref w) = *window {
                total_weight += weight;
                rates.meta_msgs_sent += weight * w.meta_msgs_sent as f64;
                rates.meta_bytes_sent += weight * w.meta_bytes_sent as f64;
                rates.meta_msgs_rcvd += weight * w.meta_msgs_rcvd as f64;
                rates.meta_bytes_rcvd += weight * w.meta_bytes_rcvd as f64;
                for (chan, count) in &w.chan_msgs_sent {
                    *rates.chan_msgs.entry(chan.clone()).or_insert(0.0) += weight * *count as f64;
                }
                for (chan, bytes) in &w.chan_bytes_sent {
                    *rates.chan_bytes.entry(chan.clone()).or_insert(0.0) += weight * *bytes as f64;
                }
            }
            weight *= ROLL_OFF;
        }

        if total_weight > 0.0 {
            rates.meta_msgs_sent /= total_weight;
            rates.meta_bytes_sent /= total_weight;
            rates.meta_msgs_rcvd /= total_weight;
            rates.meta_bytes_rcvd /= total_weight;
            for value in rates.chan_msgs.values_mut() {
                *value /= total_weight;
            }
            for value in rates.chan_bytes.values_mut() {
                *value /= total_weight;
            }
        }

        rates
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn is_monotonic(&self) -> bool {
        self.buckets.iter().zip(self.buckets.iter().skip(1)).all(|(a, b)| a.start <= b.start)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn buckets_stay_inside_the_horizon() {
        let mut window = StatWindow::new();
        let start = Instant::now();

        for step in 0..60 {
            window.advance(start + Duration::from_millis(step * 200));
            window.meta_sent(10);
        }

        assert!(window.is_monotonic());
        // 5 s horizon over 200 ms buckets
        assert!(window.bucket_count() <= 26, "kept {} buckets", window.bucket_count());
    }

    #[test]
    fn advance_within_a_bucket_does_not_split_it() {
        let mut window = StatWindow::new();
        let start = Instant::now();

        window.advance(start);
        window.advance(start + Duration::from_millis(50));
        window.advance(start + Duration::from_millis(100));

        assert_eq!(1, window.bucket_count());
    }

    #[test]
    fn recent_traffic_dominates_the_rates() {
        let mut window = StatWindow::new();
        let start = Instant::now();

        window.advance(start);
        window.meta_sent(100);

        let now = start + Duration::from_millis(2500);
        window.advance(now);
        window.meta_sent(100);

        let rates = window.rates(now);

        // one message in each populated window, the weighted mean stays at one
        assert!((rates.meta_msgs_sent - 1.0).abs() < 1e-9);
        assert!(rates.meta_bytes_sent > 0.0);
        assert_eq!(0.0, rates.meta_msgs_rcvd);
    }

    #[test]
    fn per_channel_counters_are_kept_apart() {
        let mut window = StatWindow::new();

        window.advance(Instant::now());
        window.data_rcvd("foo", 10);
        window.data_sent("foo", 10);
        window.data_sent("foo", 30);
        window.data_sent("bar", 5);

        let bucket = window.current();
        assert_eq!(Some(&2), bucket.chan_msgs_sent.get("foo"));
        assert_eq!(Some(&40), bucket.chan_bytes_sent.get("foo"));
        assert_eq!(Some(&1), bucket.chan_msgs_sent.get("bar"));
        assert_eq!(Some(&1), bucket.chan_msgs_rcvd.get("foo"));
    }
}
