//! A single scheduling facility backing every one-shot timer in the node: a
//! min-heap of timed tasks drained by one dedicated worker thread, rather
//! than a timer-per-callback approach. Cancellation is O(1) by token.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Opaque handle returned by [`Scheduler::schedule`]. Passing it to
/// [`Scheduler::cancel`] prevents the task from running if it hasn't already
/// started; a task already popped off the heap and running cannot be
/// interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    deadline: Instant,
    id: TimerId,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.deadline.cmp(&self.deadline)
    }
}

struct Inner {
    heap: BinaryHeap<ScheduledTask>,
    cancelled: std::collections::HashSet<TimerId>,
    shutdown: bool,
}

pub struct Scheduler {
    state: Arc<(Mutex<Inner>, Condvar)>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start() -> Scheduler {
        let state = Arc::new((
            Mutex::new(Inner {
                heap: BinaryHeap::new(),
                cancelled: std::collections::HashSet::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name("timer-scheduler".into())
            .spawn(move || Self::run(worker_state))
            .expect("failed to spawn timer scheduler thread");

        Scheduler {
            state,
            next_id: AtomicU64::new(1),
            worker: Some(worker),
        }
    }

    fn run(state: Arc<(Mutex<Inner>, Condvar)>) {
        let (lock, cvar) = &*state;
        loop {
            let mut inner = lock.lock().unwrap();
            loop {
                if inner.shutdown {
                    return;
                }
                match inner.heap.peek() {
                    None => {
                        inner = cvar.wait(inner).unwrap();
                    }
                    Some(next) => {
                        let deadline = next.deadline;
                        let now = Instant::now();
                        if deadline <= now {
                            break;
                        }
                        let (guard, timeout) =
                            cvar.wait_timeout(inner, deadline - now).unwrap();
                        inner = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                }
            }
            if inner.shutdown {
                return;
            }
            // Drain every task whose deadline has passed; skip cancelled ones.
            let mut due = Vec::new();
            while let Some(next) = inner.heap.peek() {
                if next.deadline > Instant::now() {
                    break;
                }
                let scheduled = inner.heap.pop().unwrap();
                if inner.cancelled.remove(&scheduled.id) {
                    continue;
                }
                due.push(scheduled.task);
            }
            drop(inner);
            for task in due {
                task();
            }
        }
    }

    /// Schedules `task` to run after `delay`. The task runs on the
    /// scheduler's own worker thread, outside any lock this scheduler owns —
    /// it is the task's job to acquire whatever state mutex it needs.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimerId(self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        let deadline = Instant::now() + delay;
        let (lock, cvar) = &*self.state;
        {
            let mut inner = lock.lock().unwrap();
            inner.heap.push(ScheduledTask {
                deadline,
                id,
                task: Box::new(task),
            });
        }
        cvar.notify_all();
        id
    }

    /// Cancels a previously scheduled task. A no-op if it already ran.
    pub fn cancel(&self, id: TimerId) {
        let (lock, _cvar) = &*self.state;
        lock.lock().unwrap().cancelled.insert(id);
    }

    pub fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.state;
            lock.lock().unwrap().shutdown = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
