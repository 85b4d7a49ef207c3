// Replay window: hourly buckets of hash -> mask bits around the current hour.
// A hash is admitted once per mask bit; anything more than 12h from now is refused.

use crate::consensus::types::Hash;
use std::collections::HashMap;
use std::sync::Mutex;

pub const BUCKETS: usize = 27;
pub const MAX_SKEW_HOURS: i64 = 12;

pub const INTERNAL_REPLAY: u32 = 1;
pub const NETWORK_REPLAY: u32 = 2;

const MS_PER_HOUR: u64 = 3_600_000;

/// Age past which a message timestamp can no longer be admitted.
pub const HORIZON_MS: u64 = MAX_SKEW_HOURS as u64 * MS_PER_HOUR;

fn hour_of(ms: u64) -> i64 {
    (ms / MS_PER_HOUR) as i64
}

struct Window {
    buckets: Vec<HashMap<Hash, u32>>,
    basetime: i64,
    center: Option<i64>,
}

impl Window {
    /// Moves the window so `now` is centered; never moves it back.
    fn advance(&mut self, now: i64) {
        let center = match self.center {
            None => {
                self.center = Some(now);
                self.basetime = now - (BUCKETS as i64 / 2);
                return;
            }
            Some(c) => c,
        };
        if now <= center {
            return;
        }
        let shift = (now - center) as usize;
        if shift >= BUCKETS {
            for b in self.buckets.iter_mut() {
                b.clear();
            }
        } else {
            self.buckets.drain(..shift);
            self.buckets.resize_with(BUCKETS, HashMap::new);
        }
        self.basetime += shift as i64;
        self.center = Some(now);
    }

    fn index(&self, ts_hour: i64) -> Option<usize> {
        let idx = ts_hour - self.basetime;
        if idx < 0 || idx >= BUCKETS as i64 {
            return None;
        }
        Some(idx as usize)
    }

    fn check(&mut self, mask: u32, hash: &Hash, ts_ms: u64, now_ms: u64) -> Option<usize> {
        let ts_hour = hour_of(ts_ms);
        let now_hour = hour_of(now_ms);
        if (ts_hour - now_hour).abs() > MAX_SKEW_HOURS {
            return None;
        }
        self.advance(now_hour);
        let idx = self.index(ts_hour)?;
        let seen = self.buckets[idx].get(hash).copied().unwrap_or(0);
        if seen & mask != 0 {
            return None;
        }
        Some(idx)
    }

    fn mark(&mut self, mask: u32, hash: &Hash, ts_ms: u64) -> bool {
        let Some(idx) = self.index(hour_of(ts_ms)) else {
            return false;
        };
        *self.buckets[idx].entry(*hash).or_insert(0) |= mask;
        true
    }
}

pub struct ReplayWindow {
    inner: Mutex<Window>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Window {
                buckets: (0..BUCKETS).map(|_| HashMap::new()).collect(),
                basetime: 0,
                center: None,
            }),
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Window> {
        // Window state is a cache; a panic elsewhere leaves it usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bucket index if `hash` has not been seen under any bit of `mask`.
    /// Slides the window forward to `now_ms` but records nothing.
    pub fn valid(&self, mask: u32, hash: &Hash, msg_ts_ms: u64, now_ms: u64) -> Option<usize> {
        self.window().check(mask, hash, msg_ts_ms, now_ms)
    }

    /// Records `hash` under `mask`. Returns false if the timestamp has left the window.
    pub fn mark_seen(&self, mask: u32, hash: &Hash, msg_ts_ms: u64) -> bool {
        self.window().mark(mask, hash, msg_ts_ms)
    }

    /// Check and record in one step.
    pub fn is_ts_valid(&self, mask: u32, hash: &Hash, msg_ts_ms: u64, now_ms: u64) -> bool {
        let mut w = self.window();
        if w.check(mask, hash, msg_ts_ms, now_ms).is_none() {
            return false;
        }
        w.mark(mask, hash, msg_ts_ms)
    }

    /// Hour currently at the center of the window, once initialized.
    pub fn center_hour(&self) -> Option<i64> {
        self.window().center
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = MS_PER_HOUR;
    const NOW: u64 = 500_000 * HOUR + 1234;

    #[test]
    fn same_bit_rejected_other_bit_accepted() {
        let rw = ReplayWindow::new();
        let h = [1u8; 32];
        assert!(rw.is_ts_valid(INTERNAL_REPLAY, &h, NOW, NOW));
        assert!(!rw.is_ts_valid(INTERNAL_REPLAY, &h, NOW, NOW));
        assert!(rw.is_ts_valid(NETWORK_REPLAY, &h, NOW, NOW));
        assert!(!rw.is_ts_valid(INTERNAL_REPLAY | NETWORK_REPLAY, &h, NOW, NOW));
    }

    #[test]
    fn check_does_not_record() {
        let rw = ReplayWindow::new();
        let h = [2u8; 32];
        assert!(rw.valid(INTERNAL_REPLAY, &h, NOW, NOW).is_some());
        assert!(rw.valid(INTERNAL_REPLAY, &h, NOW, NOW).is_some());
        assert!(rw.mark_seen(INTERNAL_REPLAY, &h, NOW));
        assert!(rw.valid(INTERNAL_REPLAY, &h, NOW, NOW).is_none());
    }

    #[test]
    fn far_timestamps_rejected() {
        let rw = ReplayWindow::new();
        let h = [3u8; 32];
        assert!(rw.valid(NETWORK_REPLAY, &h, NOW + 13 * HOUR, NOW).is_none());
        assert!(rw.valid(NETWORK_REPLAY, &h, NOW - 13 * HOUR, NOW).is_none());
        assert!(rw.valid(NETWORK_REPLAY, &h, NOW + 12 * HOUR, NOW).is_some());
        assert!(rw.valid(NETWORK_REPLAY, &h, NOW - 12 * HOUR, NOW).is_some());
    }

    #[test]
    fn window_slides_forward_only() {
        let rw = ReplayWindow::new();
        let h = [4u8; 32];
        assert!(rw.is_ts_valid(INTERNAL_REPLAY, &h, NOW, NOW));
        let later = NOW + 5 * HOUR;
        assert!(rw.valid(INTERNAL_REPLAY, &[5u8; 32], later, later).is_some());
        let center = rw.center_hour();
        // A clock stepping back leaves the center where it was.
        assert!(rw.valid(INTERNAL_REPLAY, &[6u8; 32], NOW, NOW).is_some());
        assert_eq!(rw.center_hour(), center);
        // The record survived the shift.
        assert!(rw.valid(INTERNAL_REPLAY, &h, NOW, later).is_none());
    }

    #[test]
    fn records_drop_after_full_rotation() {
        let rw = ReplayWindow::new();
        let h = [7u8; 32];
        assert!(rw.is_ts_valid(INTERNAL_REPLAY, &h, NOW, NOW));
        let much_later = NOW + 40 * HOUR;
        assert!(rw.valid(INTERNAL_REPLAY, &[8u8; 32], much_later, much_later).is_some());
        assert!(!rw.mark_seen(INTERNAL_REPLAY, &h, NOW));
    }
}
