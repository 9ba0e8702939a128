//! Byte-range readiness lock: the rendezvous between downloaders
//! writing sparse regions of a local file and readers waiting for
//! specific ranges. Waiters park on a watch channel and re-check after
//! every broadcast, so spurious wakeups are harmless.

use std::sync::Mutex;
use tokio::sync::watch;

struct RangeState {
    /// Sorted, merged, non-overlapping `[start, end)` ranges.
    ranges: Vec<(i64, i64)>,
    done: bool,
    released: Option<bool>,
}

pub struct RangeLock {
    max: i64,
    state: Mutex<RangeState>,
    version: watch::Sender<u64>,
}

impl RangeLock {
    pub fn new(max: i64) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            max,
            state: Mutex::new(RangeState {
                ranges: Vec::new(),
                done: max == 0,
                released: None,
            }),
            version,
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// True iff one existing range fully contains `[start, start+len)`.
    /// Zero-length ranges are trivially satisfied.
    pub fn satisfied(&self, start: i64, len: i64) -> bool {
        assert!(len >= 0, "negative range length");
        if len == 0 {
            return true;
        }
        let state = self.state.lock().unwrap();
        if state.done {
            return true;
        }
        Self::contains(&state.ranges, start, len)
    }

    fn contains(ranges: &[(i64, i64)], start: i64, len: i64) -> bool {
        let end = start + len;
        ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Add a satisfied range and wake waiters. No-op once done or
    /// released.
    pub fn feed(&self, start: i64, len: i64) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done || state.released.is_some() || len <= 0 {
                return;
            }
            Self::merge_in(&mut state, start, len, self.max);
        }
        self.version.send_modify(|v| *v += 1);
    }

    /// Atomic satisfied-check plus reservation: returns whether the
    /// caller won the region. Losing means the range is already fully
    /// present (or reserved by a prior winner whose feed merged it in).
    pub fn try_exclusive_feed(&self, start: i64, len: i64) -> bool {
        assert!(len >= 0, "negative range length");
        let won = {
            let mut state = self.state.lock().unwrap();
            if state.done || state.released.is_some() {
                return false;
            }
            if len == 0 || Self::contains(&state.ranges, start, len) {
                return false;
            }
            Self::merge_in(&mut state, start, len, self.max);
            true
        };
        self.version.send_modify(|v| *v += 1);
        won
    }

    fn merge_in(state: &mut RangeState, start: i64, len: i64, max: i64) {
        // Rebuilt sweep: append, sort by start, coalesce touching
        // neighbors in one pass.
        state.ranges.push((start, start + len));
        state.ranges.sort_by_key(|&(s, _)| s);
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(state.ranges.len());
        for &(s, e) in state.ranges.iter() {
            match merged.last_mut() {
                Some(last) if last.1 >= s => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        state.ranges = merged;
        if state.ranges.len() == 1 && state.ranges[0].0 <= 0 && state.ranges[0].1 >= max {
            state.done = true;
        }
    }

    /// Wake all waiters with `value`; `false` signals closed-early.
    /// Idempotent.
    pub fn release(&self, value: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.released.is_some() {
                return;
            }
            state.released = Some(value);
        }
        self.version.send_modify(|v| *v += 1);
    }

    /// Block until the range is satisfied or the lock is released.
    /// Returns `false` iff released with failure before satisfaction.
    pub async fn acquire(&self, start: i64, len: i64) -> bool {
        let mut rx = self.version.subscribe();
        loop {
            {
                let state = self.state.lock().unwrap();
                if len <= 0
                    || state.done
                    || Self::contains(&state.ranges, start, len)
                {
                    return true;
                }
                if let Some(v) = state.released {
                    return v;
                }
            }
            if rx.changed().await.is_err() {
                // Sender dropped with the lock itself.
                return false;
            }
        }
    }
}
