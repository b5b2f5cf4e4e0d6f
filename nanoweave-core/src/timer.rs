//! One-shot timer thread.
//!
//! Every [`Engine`](crate::transport::Engine) owns one `Timer`. Deadlines sit
//! in a min-heap guarded by a `parking_lot` mutex; the thread sleeps on a
//! condvar until the earliest one and runs expired tasks with the lock
//! released, so a task may schedule or cancel other timers.
//!
//! Cancelling only forgets the task; its heap entry is skipped when it
//! comes up. Once stale entries outnumber live ones the heap is rebuilt.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Stale heap entries tolerated before a rebuild, beyond one per live timer.
const STALE_SLACK: usize = 16;

/// Work run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Deadline {
    at: Instant,
    id: u64,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: earliest deadline on top, ties in scheduling order
        other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Deadline>,
    tasks: HashMap<u64, TimerTask>,
    next_id: u64,
    shutdown: bool,
}

impl TimerState {
    /// Drop heap entries whose task is gone.
    fn compact(&mut self) {
        let before = self.heap.len();
        let tasks = &self.tasks;
        self.heap.retain(|d| tasks.contains_key(&d.id));
        trace!("[TIMER] compacted heap {} -> {}", before, self.heap.len());
    }
}

struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Timer handle. Dropping it stops the thread; pending tasks are discarded.
pub struct Timer {
    shared: Arc<Shared>,
}

impl Timer {
    /// Spawn the timer thread.
    pub fn start(name: impl Into<String>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.into())
            .spawn(move || run(&worker))?;
        Ok(Self { shared })
    }

    /// Run `task` once after `after` has elapsed.
    pub fn schedule<F>(&self, after: Duration, task: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let at = Instant::now().checked_add(after).unwrap_or_else(far_future);
        let mut state = self.shared.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        if state.shutdown {
            return TimerId(id);
        }
        state.heap.push(Deadline { at, id });
        state.tasks.insert(id, Box::new(task));
        drop(state);
        self.shared.wakeup.notify_one();
        TimerId(id)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    ///
    /// The task is dropped after the timer lock is released.
    pub fn cancel(&self, id: TimerId) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            let task = state.tasks.remove(&id.0);
            if state.heap.len() > 2 * state.tasks.len() + STALE_SLACK {
                state.compact();
            }
            task
        };
        task.is_some()
    }

    /// Number of timers still pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Stop the thread without waiting for it. Idempotent.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            std::mem::take(&mut state.tasks)
        };
        self.shared.wakeup.notify_all();
        drop(tasks);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

fn far_future() -> Instant {
    // About thirty years; effectively never.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

fn run(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    trace!("[TIMER] thread exiting");
                    return;
                }
                let now = Instant::now();
                let next = state.heap.peek().map(|d| (d.at, d.id));
                match next {
                    None => shared.wakeup.wait(&mut state),
                    Some((at, id)) if at <= now => {
                        state.heap.pop();
                        // Cancelled timers leave a stale heap entry behind
                        if let Some(task) = state.tasks.remove(&id) {
                            break task;
                        }
                    }
                    Some((at, _)) => {
                        shared.wakeup.wait_until(&mut state, at);
                    }
                }
            }
        };
        task();
    }
}
