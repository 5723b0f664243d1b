// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network statistics of a transport
//!
//! Counts, per message type, what was received, sent and re-sent, plus the
//! reason behind every retransmission request. Counters of the running
//! interval are plain atomics; completed intervals are folded into a one
//! minute sliding window when a snapshot is taken.
//!
//! # Thread Safety
//!
//! Increments use atomic operations (Relaxed ordering) and never block the
//! receive path. Only [`NetworkStatistics::snapshot`] takes a lock.
//!
//! # Example
//!
//! ```ignore
//! let stats = transport.stats();
//! let window = stats.snapshot();
//! for (ty, counters) in &window.per_type {
//!     log::info!("{}: {} received, {} repeats", ty, counters.received, counters.sent_repeat);
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{STATS_HISTORY_LEN, STATS_INTERVAL};
use crate::messages::MessageType;

const TYPE_COUNT: usize = MessageType::ALL.len();

/// Counters of one message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageTypeStats {
    pub received: u64,
    pub sent: u64,
    /// Sends that repeated something already sent (retransmissions, repeated answers)
    pub sent_repeat: u64,
}

impl MessageTypeStats {
    fn is_zero(&self) -> bool {
        self.received == 0 && self.sent == 0 && self.sent_repeat == 0
    }

    fn add(&mut self, other: &MessageTypeStats) {
        self.received += other.received;
        self.sent += other.sent;
        self.sent_repeat += other.sent_repeat;
    }

    fn sub(&mut self, other: &MessageTypeStats) {
        self.received = self.received.saturating_sub(other.received);
        self.sent = self.sent.saturating_sub(other.sent);
        self.sent_repeat = self.sent_repeat.saturating_sub(other.sent_repeat);
    }
}

/// Statistics summed over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Duration covered by the sums
    pub interval: Duration,
    /// Non-zero counters only
    pub per_type: BTreeMap<MessageType, MessageTypeStats>,
    /// Retransmission requests caused by a detected sequence gap
    pub retransmit_frame_data_sequence: u64,
    /// Retransmission requests issued because a frame stalled
    pub retransmit_frame_data_idle: u64,
}

impl StatsSnapshot {
    /// Counters of `ty`, zero if nothing happened for it.
    pub fn get(&self, ty: MessageType) -> MessageTypeStats {
        self.per_type.get(&ty).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Interval {
    per_type: [MessageTypeStats; TYPE_COUNT],
    sequence: u64,
    idle: u64,
}

impl Interval {
    fn add(&mut self, other: &Interval) {
        for (mine, theirs) in self.per_type.iter_mut().zip(other.per_type.iter()) {
            mine.add(theirs);
        }
        self.sequence += other.sequence;
        self.idle += other.idle;
    }

    fn sub(&mut self, other: &Interval) {
        for (mine, theirs) in self.per_type.iter_mut().zip(other.per_type.iter()) {
            mine.sub(theirs);
        }
        self.sequence = self.sequence.saturating_sub(other.sequence);
        self.idle = self.idle.saturating_sub(other.idle);
    }
}

#[derive(Default)]
struct AtomicTypeCounters {
    received: AtomicU64,
    sent: AtomicU64,
    sent_repeat: AtomicU64,
}

#[derive(Default)]
struct AtomicInterval {
    per_type: [AtomicTypeCounters; TYPE_COUNT],
    sequence: AtomicU64,
    idle: AtomicU64,
}

impl AtomicInterval {
    /// Read and zero every counter.
    fn take(&self) -> Interval {
        self.read(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn peek(&self) -> Interval {
        self.read(|counter| counter.load(Ordering::Relaxed))
    }

    fn read(&self, load: impl Fn(&AtomicU64) -> u64) -> Interval {
        let mut interval = Interval::default();
        for (out, counters) in interval.per_type.iter_mut().zip(self.per_type.iter()) {
            out.received = load(&counters.received);
            out.sent = load(&counters.sent);
            out.sent_repeat = load(&counters.sent_repeat);
        }
        interval.sequence = load(&self.sequence);
        interval.idle = load(&self.idle);
        interval
    }
}

struct Window {
    created: Instant,
    /// Start of the running interval
    current_start: Instant,
    /// Completed intervals, oldest first
    history: VecDeque<Interval>,
    /// Sum of `history`
    sum: Interval,
    /// Everything ever rotated out of the running interval
    lifetime: Interval,
}

/// Per-transport network statistics.
pub struct NetworkStatistics {
    current: AtomicInterval,
    window: Mutex<Window>,
    interval: Duration,
    history_len: usize,
}

impl NetworkStatistics {
    pub fn new() -> Self {
        Self::with_window(STATS_INTERVAL, STATS_HISTORY_LEN)
    }

    /// Statistics with a custom interval length and number of kept intervals.
    pub fn with_window(interval: Duration, history_len: usize) -> Self {
        Self {
            current: AtomicInterval::default(),
            window: Mutex::new(Window {
                created: Instant::now(),
                current_start: Instant::now(),
                history: VecDeque::with_capacity(history_len),
                sum: Interval::default(),
                lifetime: Interval::default(),
            }),
            interval,
            history_len: history_len.max(1),
        }
    }

    #[inline]
    pub fn record_received(&self, ty: MessageType) {
        self.current.per_type[ty.index()]
            .received
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sent(&self, ty: MessageType) {
        self.current.per_type[ty.index()]
            .sent
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sent_repeat(&self, ty: MessageType) {
        self.current.per_type[ty.index()]
            .sent_repeat
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A retransmission was requested because of a sequence gap.
    #[inline]
    pub fn record_retransmit_sequence(&self) {
        self.current.sequence.fetch_add(1, Ordering::Relaxed);
    }

    /// A retransmission was requested because a frame stalled.
    #[inline]
    pub fn record_retransmit_idle(&self) {
        self.current.idle.fetch_add(1, Ordering::Relaxed);
    }

    /// Sums over the sliding window (completed intervals only).
    ///
    /// Rotates the running interval first if it is over.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut window = self.window.lock();
        self.rotate(&mut window, Instant::now());
        let covered = self.interval * window.history.len() as u32;
        to_snapshot(&window.sum, covered)
    }

    /// Totals since creation, including the running interval.
    pub fn lifetime(&self) -> StatsSnapshot {
        let window = self.window.lock();
        let mut total = window.lifetime;
        total.add(&self.current.peek());
        to_snapshot(&total, window.created.elapsed())
    }

    fn rotate(&self, window: &mut Window, now: Instant) {
        let elapsed = now.duration_since(window.current_start);
        if elapsed < self.interval {
            return;
        }
        let completed = self.current.take();
        window.lifetime.add(&completed);
        window.sum.add(&completed);
        window.history.push_back(completed);

        // Intervals without any activity are kept as zero entries
        let passed = (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as usize;
        let idle_intervals = passed.saturating_sub(1).min(self.history_len);
        for _ in 0..idle_intervals {
            window.history.push_back(Interval::default());
        }
        window.current_start += self.interval * passed.min(u32::MAX as usize) as u32;

        while window.history.len() > self.history_len {
            if let Some(oldest) = window.history.pop_front() {
                window.sum.sub(&oldest);
            }
        }
    }
}

impl Default for NetworkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

fn to_snapshot(interval: &Interval, covered: Duration) -> StatsSnapshot {
    let per_type = MessageType::ALL
        .iter()
        .map(|ty| (*ty, interval.per_type[ty.index()]))
        .filter(|(_, counters)| !counters.is_zero())
        .collect();
    StatsSnapshot {
        interval: covered,
        per_type,
        retransmit_frame_data_sequence: interval.sequence,
        retransmit_frame_data_idle: interval.idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_snapshot_excludes_running_interval() {
        let stats = NetworkStatistics::with_window(Duration::from_secs(3600), 4);
        stats.record_sent(MessageType::FrameData);
        let snapshot = stats.snapshot();
        assert!(snapshot.per_type.is_empty());
        assert_eq!(snapshot.interval, Duration::ZERO);
    }

    #[test]
    fn test_rotation_moves_counters_into_window() {
        let stats = NetworkStatistics::with_window(Duration::from_millis(10), 4);
        stats.record_sent(MessageType::FrameData);
        stats.record_sent(MessageType::FrameData);
        stats.record_sent_repeat(MessageType::FrameData);
        stats.record_received(MessageType::RetransmitFrameData);
        stats.record_retransmit_idle();
        thread::sleep(Duration::from_millis(15));

        let snapshot = stats.snapshot();
        let frame_data = snapshot.get(MessageType::FrameData);
        assert_eq!(frame_data.sent, 2);
        assert_eq!(frame_data.sent_repeat, 1);
        assert_eq!(snapshot.get(MessageType::RetransmitFrameData).received, 1);
        assert_eq!(snapshot.retransmit_frame_data_idle, 1);
        assert_eq!(snapshot.retransmit_frame_data_sequence, 0);
        assert!(!snapshot.per_type.contains_key(&MessageType::SurveyRepeaters));
    }

    #[test]
    fn test_old_intervals_leave_window() {
        let stats = NetworkStatistics::with_window(Duration::from_millis(5), 2);
        stats.record_received(MessageType::FrameData);
        thread::sleep(Duration::from_millis(40));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get(MessageType::FrameData).received, 0);
        assert!(snapshot.interval <= Duration::from_millis(10));
    }

    #[test]
    fn test_lifetime_keeps_everything() {
        let stats = NetworkStatistics::with_window(Duration::from_millis(5), 1);
        stats.record_retransmit_sequence();
        thread::sleep(Duration::from_millis(20));
        let _ = stats.snapshot();
        stats.record_retransmit_sequence();
        let lifetime = stats.lifetime();
        assert_eq!(lifetime.retransmit_frame_data_sequence, 2);
    }
}
