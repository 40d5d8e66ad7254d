//! One-shot completion latch per job class.

use std::sync::atomic::{AtomicBool, Ordering};

use jobtrack_core::JobClass;

/// Lets exactly one caller run the finish side effects of an episode.
///
/// Each class owns one atomic flag. [`try_latch`](Self::try_latch) is a
/// test-and-set, so concurrent callers on a multi-threaded runtime still see
/// exactly one `true` until the latch is [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct CompletionGuard {
    latches: [AtomicBool; 3],
}

impl CompletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the latch. Returns `true` for the caller that closed it.
    pub fn try_latch(&self, job_class: JobClass) -> bool {
        self.latches[job_class.index()]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-open the latch for the next episode.
    pub fn reset(&self, job_class: JobClass) {
        self.latches[job_class.index()].store(false, Ordering::Release);
    }

    pub fn is_latched(&self, job_class: JobClass) -> bool {
        self.latches[job_class.index()].load(Ordering::Acquire)
    }
}
