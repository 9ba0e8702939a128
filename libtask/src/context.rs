use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::time::Instant;

use crate::models::Progress;

struct CtxInner {
    canceled: AtomicBool,
    loaded: AtomicI64,
    total: AtomicI64,
    deadline: Option<Instant>,
}

/// Handle a running task polls for cancellation and uses to report
/// progress. Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<CtxInner>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    pub fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                canceled: AtomicBool::new(false),
                loaded: AtomicI64::new(0),
                total: AtomicI64::new(0),
                deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst) || self.deadline_exceeded()
    }

    pub fn deadline_exceeded(&self) -> bool {
        match self.inner.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Report loaded bytes/items. `abs=false` adds a delta (monotonic),
    /// `abs=true` resets the counter to `v`.
    pub fn progress(&self, v: i64, abs: bool) {
        if abs {
            self.inner.loaded.store(v, Ordering::SeqCst);
        } else {
            self.inner.loaded.fetch_add(v, Ordering::SeqCst);
        }
    }

    pub fn total(&self, v: i64, abs: bool) {
        if abs {
            self.inner.total.store(v, Ordering::SeqCst);
        } else {
            self.inner.total.fetch_add(v, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            loaded: self.inner.loaded.load(Ordering::SeqCst),
            total: self.inner.total.load(Ordering::SeqCst),
        }
    }
}
