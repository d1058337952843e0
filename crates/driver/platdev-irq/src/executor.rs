//! Deferred execution contexts: the shared worker pool, dedicated handler
//! threads, and the coalescing timer queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Condvar, Mutex};

/// A unit of deferred work.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>, String>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|e| e.to_string())
}

// ---- Worker pool ------------------------------------------------------------

/// Shared pool running [`Threading::None`](crate::Threading::None) work.
///
/// Workers exit once every sender is gone and the queue is drained.
pub(crate) struct WorkerPool {
    tx: Sender<Job>,
}

impl WorkerPool {
    pub(crate) fn new(workers: usize) -> Result<Self, String> {
        let (tx, rx) = unbounded::<Job>();
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            spawn_named(format!("irq-deferred/{i}"), move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })?;
        }
        Ok(Self { tx })
    }

    pub(crate) fn sender(&self) -> Sender<Job> {
        self.tx.clone()
    }
}

// ---- Per-registration executor ----------------------------------------------

/// Where one registration's deferred jobs go.
pub(crate) enum Executor {
    Pool(Sender<Job>),
    Dedicated {
        tx: Mutex<Option<Sender<Job>>>,
        thread: Mutex<Option<JoinHandle<()>>>,
    },
}

impl Executor {
    pub(crate) fn dedicated(name: String) -> Result<Self, String> {
        let (tx, rx) = unbounded::<Job>();
        let thread = spawn_named(name, move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        })?;
        Ok(Self::Dedicated {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `job`. Returns `false` if the executor has shut down.
    pub(crate) fn submit(&self, job: Job) -> bool {
        match self {
            Self::Pool(tx) => tx.send(job).is_ok(),
            Self::Dedicated { tx, .. } => tx.lock().as_ref().is_some_and(|tx| tx.send(job).is_ok()),
        }
    }

    /// Stops a dedicated thread after its queue drains. The shared pool is
    /// left alone.
    pub(crate) fn shutdown(&self) {
        if let Self::Dedicated { tx, thread } = self {
            tx.lock().take();
            let handle = thread.lock().take();
            if let Some(handle) = handle {
                // The handler thread cannot join itself.
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }

    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        match self {
            Self::Pool(_) => None,
            Self::Dedicated { thread, .. } => thread.lock().as_ref().map(|h| h.thread().id()),
        }
    }
}

// ---- Timer queue ------------------------------------------------------------

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    key: u64,
    fire: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    shutdown: bool,
}

/// One-shot timers keyed by registration.
///
/// A single thread sleeps until the earliest deadline, pops every expired
/// entry, drops the lock, and runs the callbacks.
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cv: Condvar,
}

impl TimerQueue {
    pub(crate) fn start() -> Result<Arc<Self>, String> {
        let queue = Arc::new(Self {
            state: Mutex::new(TimerState::default()),
            cv: Condvar::new(),
        });
        let runner = Arc::clone(&queue);
        spawn_named("irq-coalesce".into(), move || runner.run())?;
        Ok(queue)
    }

    /// Arms a timer that runs `fire` at `deadline`.
    pub(crate) fn arm(&self, deadline: Instant, key: u64, fire: Job) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            key,
            fire,
        }));
        drop(state);
        self.cv.notify_one();
    }

    /// Disarms every timer with `key`. Returns how many were removed.
    pub(crate) fn cancel(&self, key: u64) -> usize {
        let mut state = self.state.lock();
        let before = state.heap.len();
        state.heap.retain(|Reverse(e)| e.key != key);
        before - state.heap.len()
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    fn run(&self) {
        loop {
            let mut expired = Vec::new();
            {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    let next = state.heap.peek().map(|Reverse(e)| e.deadline);
                    match next {
                        None => self.cv.wait(&mut state),
                        Some(deadline) if deadline <= now => break,
                        Some(deadline) => {
                            self.cv.wait_until(&mut state, deadline);
                        }
                    }
                }
                let now = Instant::now();
                while state
                    .heap
                    .peek()
                    .is_some_and(|Reverse(e)| e.deadline <= now)
                {
                    if let Some(Reverse(entry)) = state.heap.pop() {
                        expired.push(entry.fire);
                    }
                }
            }
            for fire in expired {
                fire();
            }
        }
    }
}
