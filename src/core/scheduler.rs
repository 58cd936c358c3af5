//! Periodic task scheduling.
//!
//! [`PeriodicScheduler`] is the capability the store consumes to drive
//! background cleanup. [`ThreadScheduler`] is a single worker thread fed by a
//! min-heap of due times; cancellation can wait (bounded) for a running
//! execution to finish, which keeps shutdown deterministic in tests.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::{Error, Result};

pub type TaskId = u64;

pub type PeriodicTask = Box<dyn FnMut(&TaskContext) + Send + 'static>;

/// Handed to every execution; lets long-running tasks observe an interrupt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    interrupted: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

pub trait PeriodicScheduler: Send + Sync {
    fn execute_periodically(
        &self,
        name: &str,
        task: PeriodicTask,
        period: Duration,
        run_immediately: bool,
    ) -> Result<TaskId>;

    /// Stops future executions of `task`.
    ///
    /// With `interrupt`, a running execution sees [`TaskContext::is_interrupted`].
    /// With `wait`, blocks up to the timeout for a running execution to end.
    /// Returns true when the task was known and is no longer running.
    fn cancel(&self, task: TaskId, interrupt: bool, wait: Option<Duration>) -> bool;
}

struct TaskEntry {
    name: String,
    period: Duration,
    job: Option<PeriodicTask>,
    interrupted: Arc<AtomicBool>,
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Reverse<(Instant, TaskId)>>,
    tasks: HashMap<TaskId, TaskEntry>,
    running: Option<TaskId>,
    next_id: TaskId,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    idle: Condvar,
}

pub struct ThreadScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    pub fn new(thread_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run_worker(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of scheduled (not cancelled) tasks.
    pub fn task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Stops the worker after any running execution. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.tasks.clear();
            state.queue.clear();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::warn!("scheduler worker panicked during shutdown");
            }
        }
    }
}

impl PeriodicScheduler for ThreadScheduler {
    fn execute_periodically(
        &self,
        name: &str,
        task: PeriodicTask,
        period: Duration,
        run_immediately: bool,
    ) -> Result<TaskId> {
        if period.is_zero() {
            return Err(Error::invalid("task period must be non-zero"));
        }
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(
            id,
            TaskEntry {
                name: name.to_string(),
                period,
                job: Some(task),
                interrupted: Arc::new(AtomicBool::new(false)),
            },
        );
        let first = if run_immediately {
            Instant::now()
        } else {
            Instant::now() + period
        };
        state.queue.push(Reverse((first, id)));
        drop(state);
        self.shared.wake.notify_all();
        log::debug!("scheduled task {name} ({id}) every {period:?}");
        Ok(id)
    }

    fn cancel(&self, task: TaskId, interrupt: bool, wait: Option<Duration>) -> bool {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.tasks.remove(&task) else {
            return false;
        };
        if interrupt {
            entry.interrupted.store(true, Ordering::Release);
        }
        log::debug!("cancelled task {} ({task})", entry.name);
        match wait {
            None => state.running != Some(task),
            Some(timeout) => wait_until_idle(&self.shared, &mut state, task, timeout),
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_until_idle(
    shared: &Shared,
    state: &mut MutexGuard<'_, SchedulerState>,
    task: TaskId,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while state.running == Some(task) {
        if shared.idle.wait_until(state, deadline).timed_out() {
            return state.running != Some(task);
        }
    }
    true
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(&Reverse((due, id))) = state.queue.peek() else {
            shared.wake.wait(&mut state);
            continue;
        };
        if due > Instant::now() {
            shared.wake.wait_until(&mut state, due);
            continue;
        }
        state.queue.pop();

        let Some(entry) = state.tasks.get_mut(&id) else {
            continue;
        };
        let Some(mut job) = entry.job.take() else {
            continue;
        };
        let ctx = TaskContext {
            interrupted: Arc::clone(&entry.interrupted),
        };
        state.running = Some(id);

        let outcome = MutexGuard::unlocked(&mut state, || {
            catch_unwind(AssertUnwindSafe(|| job(&ctx)))
        });

        state.running = None;
        if let Some(entry) = state.tasks.get_mut(&id) {
            if outcome.is_err() {
                log::warn!("periodic task {} panicked; will run again", entry.name);
            }
            let next = Instant::now() + entry.period;
            entry.job = Some(job);
            state.queue.push(Reverse((next, id)));
        }
        shared.idle.notify_all();
    }
    state.running = None;
    shared.idle.notify_all();
}
