//! Requests, the priority queue they wait in, and the threads which run them.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::RandomState;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::*;

/// An opaque ticket for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) u64);

impl Handle {
    /// Never issued.
    pub const NULL: Handle = Handle(0);
}

/// Higher priorities run first.
pub type Priority = u32;

#[derive(Debug)]
pub(crate) enum Job {
    Read {
        id: TextureId,
        offset: u64,
        size: Option<u64>,
    },
    Write {
        id: TextureId,
        data: Vec<u8>,
        image_size: u32,
        preview: Option<FastCacheImage>,
    },
    ReadFile {
        path: PathBuf,
        id: TextureId,
        offset: u64,
        size: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Queued,
    Running,
    Finished { success: bool },
    Aborted,
}

/// A finished request whose responder is waiting for [crate::TextureCache::update].
pub(crate) struct Completion {
    pub handle: Handle,
    pub responder: Box<dyn Responder>,
    pub success: bool,
}

/// One request's state, shared between the facade and the worker thread that runs it.
pub struct Worker {
    handle: Handle,
    job: Mutex<Option<Job>>,
    status: Mutex<WorkerStatus>,
    responder: Mutex<Option<Box<dyn Responder>>>,
}

impl Worker {
    pub(crate) fn new(handle: Handle, job: Job, responder: Box<dyn Responder>) -> Worker {
        Worker {
            handle,
            job: Mutex::new(Some(job)),
            status: Mutex::new(WorkerStatus::Queued),
            responder: Mutex::new(Some(responder)),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.status(),
            WorkerStatus::Finished { .. } | WorkerStatus::Aborted
        )
    }

    /// Claim the job for running.  Returns `None` if it was aborted first.
    pub(crate) fn begin(&self) -> Option<Job> {
        let mut status = self.status.lock();
        if *status != WorkerStatus::Queued {
            return None;
        }
        *status = WorkerStatus::Running;
        self.job.lock().take()
    }

    /// Record the result and queue the responder for delivery.
    ///
    /// If the request was aborted the responder is already gone and nothing is queued.
    pub(crate) fn finish(
        &self,
        success: bool,
        data: Option<TextureData>,
        completed: &Sender<Completion>,
    ) {
        let responder = {
            let mut status = self.status.lock();
            if *status == WorkerStatus::Aborted {
                return;
            }
            *status = WorkerStatus::Finished { success };
            self.responder.lock().take()
        };
        if let Some(mut responder) = responder {
            if let Some(d) = data {
                responder.set_data(d);
            }
            let _ = completed.send(Completion {
                handle: self.handle,
                responder,
                success,
            });
        }
    }

    /// Give up on the request.  Work that is already running carries on, but nobody hears about it.
    ///
    /// Returns true if the request had already finished, meaning its completion is queued and must be discarded by
    /// whoever drains the queue.
    pub(crate) fn abort(&self) -> bool {
        let mut status = self.status.lock();
        if let WorkerStatus::Finished { .. } = *status {
            return true;
        }
        *status = WorkerStatus::Aborted;
        self.job.lock().take();
        self.responder.lock().take();
        false
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("handle", &self.handle)
            .field("status", &self.status())
            .finish()
    }
}

/// Orders the queue: highest priority first, then lowest sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: i64,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<QueueKey, Arc<Worker>>,
    keys: HashMap<Handle, QueueKey, RandomState>,
    next_seq: i64,
    /// Decreases, so that anything moved to the front of its priority class beats everything already there.
    front_seq: i64,
    closed: bool,
}

/// The queue of requests waiting for a worker thread.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        Default::default()
    }

    /// Returns false if the queue is closed.
    pub(crate) fn push(&self, priority: Priority, worker: Arc<Worker>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let key = QueueKey {
            priority: Reverse(priority),
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.keys.insert(worker.handle(), key);
        state.pending.insert(key, worker);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Block until there is work, or return `None` once the queue is closed.
    pub(crate) fn pop(&self) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            let first = state.pending.keys().next().copied();
            if let Some(key) = first {
                let worker = state.pending.remove(&key)?;
                state.keys.remove(&worker.handle());
                return Some(worker);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Move a queued request ahead of everything else at its priority.
    pub(crate) fn move_to_front(&self, handle: Handle) -> bool {
        let mut state = self.state.lock();
        let old = match state.keys.get(&handle) {
            Some(k) => *k,
            None => return false,
        };
        let worker = match state.pending.remove(&old) {
            Some(w) => w,
            None => return false,
        };
        state.front_seq -= 1;
        let key = QueueKey {
            priority: old.priority,
            seq: state.front_seq,
        };
        state.keys.insert(handle, key);
        state.pending.insert(key, worker);
        true
    }

    /// Drop a request which hasn't started yet.
    pub(crate) fn remove(&self, handle: Handle) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        let key = state.keys.remove(&handle)?;
        state.pending.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out work, returning whatever never started.
    pub(crate) fn close(&self) -> Vec<Arc<Worker>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.keys.clear();
        let leftover = std::mem::take(&mut state.pending).into_values().collect();
        drop(state);
        self.ready.notify_all();
        leftover
    }
}

/// Background threads draining a [WorkQueue].
pub(crate) struct WorkerPool {
    queue: Arc<WorkQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<WorkQueue>,
        run: Arc<dyn Fn(&Worker) + Send + Sync>,
    ) -> Result<WorkerPool> {
        let mut threads = Vec::with_capacity(count);
        for i in 0..count.max(1) {
            let queue = queue.clone();
            let run = run.clone();
            let handle = thread::Builder::new()
                .name(format!("texture-cache-{}", i))
                .spawn(move || {
                    while let Some(worker) = queue.pop() {
                        if panic::catch_unwind(AssertUnwindSafe(|| run(&worker))).is_err() {
                            error!(handle = worker.handle().0, "Texture cache request panicked");
                        }
                    }
                    debug!("Texture cache worker stopped");
                })?;
            threads.push(handle);
        }
        Ok(WorkerPool { queue, threads })
    }

    /// Close the queue and wait for running requests to finish.
    pub fn shutdown(&mut self) -> Vec<Arc<Worker>> {
        let leftover = self.queue.close();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        leftover
    }
}
