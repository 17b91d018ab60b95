use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Progress sink and cancellation source of a run.
///
/// Implementations are called from the orchestrating thread, or from the strategy when the run
/// has a single block.
pub trait ProgressReporter: Send + Sync {
    fn set_total_steps(&self, steps: usize);
    fn pulse(&self);
    fn current_step(&self) -> usize;
    /// `false` requests cancellation.
    fn is_active(&self) -> bool;
}

/// Atomic [`ProgressReporter`] which can be cancelled from any thread.
#[derive(Debug)]
pub struct TaskProgress {
    total: AtomicUsize,
    current: AtomicUsize,
    active: AtomicBool,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            total: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            active: AtomicBool::new(true),
        }
    }
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn total_steps(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

impl ProgressReporter for TaskProgress {
    fn set_total_steps(&self, steps: usize) {
        self.total.store(steps, Ordering::Release);
        self.current.store(0, Ordering::Release);
    }

    fn pulse(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    fn current_step(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulses_and_cancels() {
        let progress = TaskProgress::new();
        progress.set_total_steps(3);
        progress.pulse();
        progress.pulse();
        assert_eq!(progress.current_step(), 2);
        assert_eq!(progress.total_steps(), 3);
        assert!(progress.is_active());
        progress.cancel();
        assert!(!progress.is_active());
    }
}
