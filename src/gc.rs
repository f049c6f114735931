//! Garbage collection queue and deferred scheduler.
//!
//! ## Queue
//!
//! [`GcQueue`] is a FIFO of weak back-links to machines that something has
//! flagged as possibly unreferenced. A machine's `in_gc_queue` flag is true
//! exactly while it sits in the queue, which makes enqueueing idempotent.
//!
//! ## Scheduling
//!
//! [`DeferredGc`] owns a single tokio task, spawned the first time it is
//! armed and re-armed through a [`Notify`] afterwards:
//!
//! ```text
//!   request_gc ─┐
//!   request_gc ─┼─▶ notify_one ──▶ [task] notified ─▶ yield_now ─▶ run_gc(true)
//!   request_gc ─┘    (permits coalesce)
//! ```
//!
//! Yielding once before draining lets every enqueue made during the current
//! scheduler turn land in the same pass, and keeps the drain behind any
//! work that is already runnable.

use crate::machine::Machine;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// GC Queue
// =============================================================================

/// FIFO of machines awaiting a collection decision.
#[derive(Debug, Default)]
pub struct GcQueue {
    entries: VecDeque<Weak<Machine>>,
}

impl GcQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `machine` unless it is already queued.
    ///
    /// Returns true if the machine was added.
    pub fn push(&mut self, machine: &Arc<Machine>) -> bool {
        if machine.mark_queued(true) {
            return false;
        }
        self.entries.push_back(Arc::downgrade(machine));
        true
    }

    /// Pops the head of the queue and clears its queue flag.
    ///
    /// Entries whose machine has already been freed are skipped.
    pub fn pop(&mut self) -> Option<Arc<Machine>> {
        while let Some(weak) = self.entries.pop_front() {
            if let Some(machine) = weak.upgrade() {
                machine.mark_queued(false);
                return Some(machine);
            }
        }
        None
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `machine` is queued.
    pub fn contains(&self, machine: &Arc<Machine>) -> bool {
        self.entries
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(machine)))
    }
}

// =============================================================================
// Deferred Scheduler
// =============================================================================

/// Something the deferred task can drain.
pub trait GcDrain: Send + Sync + 'static {
    /// Runs one full drain of the GC queue.
    fn drain(&self);
}

/// Handle to the single deferred GC task.
#[derive(Debug, Default)]
pub struct DeferredGc {
    notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredGc {
    /// Creates an unarmed scheduler; no task exists until the first arm.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the task has been spawned and is still alive.
    pub fn is_registered(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Arms the deferred drain.
    ///
    /// Spawns the task on first use (or if it has exited), otherwise only
    /// re-arms it. Best effort: without a tokio runtime the arm is skipped
    /// with a warning and the next call tries again.
    pub fn arm<D: GcDrain>(&self, target: Weak<D>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());

        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            self.notify.notify_one();
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to allocate deferred GC task, ignoring");
                return;
            }
        };

        let notify = Arc::clone(&self.notify);
        *task = Some(handle.spawn(async move {
            loop {
                notify.notified().await;
                tokio::task::yield_now().await;
                let Some(target) = target.upgrade() else {
                    debug!("GC target dropped, deferred GC task exiting");
                    return;
                };
                target.drain();
            }
        }));
        debug!("Deferred GC task registered");
        self.notify.notify_one();
    }
}

impl Drop for DeferredGc {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl GcDrain for Counter {
        fn drain(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_queue_skips_freed_machines() {
        let mut queue = GcQueue::new();
        let gone = Arc::new(Machine::new("gone"));
        let kept = Arc::new(Machine::new("kept"));
        queue.push(&gone);
        queue.push(&kept);
        drop(gone);

        let head = queue.pop().unwrap();
        assert_eq!(head.name(), "kept");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_arm_without_runtime_is_skipped() {
        let gc = DeferredGc::new();
        let target = Arc::new(Counter::default());
        gc.arm(Arc::downgrade(&target));
        assert!(!gc.is_registered());
    }

    #[tokio::test]
    async fn test_arm_registers_once_and_coalesces() {
        let gc = DeferredGc::new();
        let target = Arc::new(Counter::default());

        gc.arm(Arc::downgrade(&target));
        gc.arm(Arc::downgrade(&target));
        gc.arm(Arc::downgrade(&target));
        assert!(gc.is_registered());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // A single stored permit: three arms in one turn drain once.
        assert_eq!(target.0.load(Ordering::SeqCst), 1);

        gc.arm(Arc::downgrade(&target));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_task_exits_when_target_dropped() {
        let gc = DeferredGc::new();
        let target = Arc::new(Counter::default());
        gc.arm(Arc::downgrade(&target));
        drop(target);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!gc.is_registered());
    }
}
