//! The [TextureCache] is the only thing callers talk to.
//!
//! Requests return a [Handle] straight away and run on background workers.  Workers never call back into client code:
//! they push finished responders onto a channel which [TextureCache::update], called periodically from the owning
//! thread, drains.  `update` is also where purging and header flushes make progress, within the time budget it is
//! given.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::worker::{Completion, Job, WorkQueue, WorkerPool};
use crate::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// A snapshot of the cache's counters and budgets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub bytes_used: u64,
    pub max_bytes: u64,
    pub entries: usize,
    pub max_entries: u32,
    pub pending_deletions: usize,
    pub pending_entry_writes: usize,
}

/// State shared with the worker threads.
pub(crate) struct CacheInner {
    pub(crate) location: PathBuf,
    pub(crate) max_total_bytes: u64,
    pub(crate) max_entries: u32,
    pub(crate) read_only: bool,
    pub(crate) header: HeaderStore,
    pub(crate) bodies: BodyStore,
    pub(crate) fast_cache: Option<FastCache>,
    pub(crate) local: Arc<LocalFiles>,
    pub(crate) deletions: DeletionQueue,
    pub(crate) purge_requested: AtomicBool,
    pub(crate) completed: Sender<Completion>,
}

/// Fails the request if running it panics, so its responder still completes.
struct FailOnUnwind<'a> {
    worker: &'a Worker,
    completed: &'a Sender<Completion>,
}

impl Drop for FailOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.worker.finish(false, None, self.completed);
        }
    }
}

impl CacheInner {
    pub(crate) fn run_worker(&self, worker: &Worker) {
        let job = match worker.begin() {
            Some(j) => j,
            None => return,
        };
        let _guard = FailOnUnwind {
            worker,
            completed: &self.completed,
        };

        let (success, data) = match job {
            Job::Read { id, offset, size } => match self.do_read(id, offset, size) {
                Ok(Some(d)) => (true, Some(d)),
                Ok(None) => (false, None),
                Err(e) => {
                    debug!(%id, error = %e, "Texture cache read failed");
                    (false, None)
                }
            },
            Job::Write {
                id,
                data,
                image_size,
                preview,
            } => match self.do_write(worker.handle(), id, data, image_size, preview) {
                Ok(()) => (true, None),
                Err(e) => {
                    warn!(%id, error = %e, "Texture cache write failed");
                    (false, None)
                }
            },
            Job::ReadFile {
                path,
                id,
                offset,
                size,
            } => match self.local.read(&path, offset, size) {
                Ok((data, len)) if !data.is_empty() => (
                    true,
                    Some(TextureData {
                        data,
                        image_size: len.min(u32::MAX as u64) as u32,
                        local: true,
                    }),
                ),
                Ok(_) => (false, None),
                Err(e) => {
                    debug!(%id, path = %path.display(), error = %e, "Local texture read failed");
                    (false, None)
                }
            },
        };

        worker.finish(success, data, &self.completed);
    }

    /// `Ok(None)` is a plain miss.
    fn do_read(&self, id: TextureId, offset: u64, size: Option<u64>) -> Result<Option<TextureData>> {
        // The body is opened under the header lock, so it is the one the entry describes even if a write of the same
        // id commits while we read.
        let opened = self.header.with_entry(id, |_, entry| {
            let body_size = entry.body_size() as u64;
            if offset >= body_size {
                return Ok(None);
            }
            match self.bodies.open(id) {
                Ok(file) => Ok(Some((file, *entry))),
                Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!(%id, "Texture cache entry has no body");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })?;
        let (file, entry) = match opened {
            Some(Ok(Some(o))) => o,
            Some(Err(e)) => return Err(e),
            _ => return Ok(None),
        };

        let available = entry.body_size() as u64 - offset;
        let want = size.map_or(available, |s| s.min(available));
        let data = BodyStore::read_file(file, offset, Some(want))?;
        if data.is_empty() {
            return Ok(None);
        }
        if !self.read_only {
            self.header.touch(id)?;
        }
        Ok(Some(TextureData {
            data,
            image_size: entry.image_size(),
            local: false,
        }))
    }

    fn do_write(
        &self,
        handle: Handle,
        id: TextureId,
        data: Vec<u8>,
        image_size: u32,
        preview: Option<FastCacheImage>,
    ) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        if id.is_nil() || data.is_empty() || data.len() > u32::MAX as usize {
            return Err(CacheError::InvalidPayload(data.len()));
        }
        if let Some(p) = &preview {
            p.validate()?;
        }
        let body_size = data.len() as u32;
        let staged = self.bodies.stage(id, handle.0, &data)?;
        let slot = self
            .header
            .commit_body(id, image_size, body_size, || self.bodies.commit(id, &staged))?;

        if let (Some(fast), Some(preview)) = (&self.fast_cache, preview) {
            if let Err(e) = fast.write(slot, id, &preview) {
                debug!(%id, error = %e, "Could not write fast cache preview");
            }
        }
        if self.over_budget() {
            self.purge_requested.store(true, Ordering::Release);
        }
        Ok(())
    }
}

/// In-flight requests by handle.  Guarded by the workers lock.
#[derive(Default)]
struct WorkerMaps {
    readers: HashMap<Handle, Arc<Worker>, RandomState>,
    writers: HashMap<Handle, Arc<Worker>, RandomState>,
    /// Aborted after finishing; their queued completions are dropped instead of delivered.
    aborted: HashSet<Handle, RandomState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Read,
    Write,
}

impl WorkerMaps {
    fn map(&mut self, kind: RequestKind) -> &mut HashMap<Handle, Arc<Worker>, RandomState> {
        match kind {
            RequestKind::Read => &mut self.readers,
            RequestKind::Write => &mut self.writers,
        }
    }
}

pub struct TextureCache {
    config: CacheConfig,
    state: CacheState,
    inner: Option<Arc<CacheInner>>,
    pool: Option<WorkerPool>,
    queue: Arc<WorkQueue>,
    local: Arc<LocalFiles>,
    workers: Mutex<WorkerMaps>,
    completed_tx: Sender<Completion>,
    completed_rx: Receiver<Completion>,
    next_handle: AtomicU64,
    reads_issued: AtomicU64,
    writes_issued: AtomicU64,
}

impl TextureCache {
    /// Build an uninitialized cache.  Nothing touches the disk until [TextureCache::init_cache].
    pub fn new(config: CacheConfig) -> TextureCache {
        let (completed_tx, completed_rx) = crossbeam::channel::unbounded();
        let local = Arc::new(LocalFiles::new(
            config.local_root.clone(),
            config.local_extensions.clone(),
        ));
        TextureCache {
            config,
            state: CacheState::Uninitialized,
            inner: None,
            pool: None,
            queue: Arc::new(WorkQueue::new()),
            local,
            workers: Default::default(),
            completed_tx,
            completed_rx,
            next_handle: AtomicU64::new(1),
            reads_issued: AtomicU64::new(0),
            writes_issued: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Open the cache stored at `location` with a byte budget of `max_size_bytes`, and start the workers.
    ///
    /// A header which can't be trusted wipes the whole cache.  Returns the byte budget in effect.
    pub fn init_cache(&mut self, location: impl AsRef<Path>, max_size_bytes: u64) -> Result<u64> {
        if self.state != CacheState::Uninitialized {
            return Err(CacheError::AlreadyInitialized);
        }
        self.state = CacheState::Initializing;
        self.config.max_total_bytes = max_size_bytes;

        let inner = match self.open_location(location.as_ref()) {
            Ok(i) => Arc::new(i),
            Err(e) => {
                self.state = CacheState::Uninitialized;
                return Err(e);
            }
        };

        let runner = inner.clone();
        let run: Arc<dyn Fn(&Worker) + Send + Sync> = Arc::new(move |w: &Worker| runner.run_worker(w));
        match WorkerPool::spawn(self.config.worker_threads, self.queue.clone(), run) {
            Ok(pool) => self.pool = Some(pool),
            Err(e) => {
                self.state = CacheState::Uninitialized;
                return Err(e);
            }
        }

        info!(
            location = %inner.location.display(),
            entries = inner.header.len(),
            bytes = inner.header.total_body_bytes(),
            max_bytes = inner.max_total_bytes,
            max_entries = inner.max_entries,
            read_only = inner.read_only,
            "Texture cache ready"
        );
        self.inner = Some(inner);
        self.state = CacheState::Ready;
        Ok(max_size_bytes)
    }

    fn open_location(&self, location: &Path) -> Result<CacheInner> {
        let read_only = self.config.read_only;
        if !read_only {
            fs::create_dir_all(location)?;
        }
        let fast_cache = if self.config.fast_cache {
            Some(FastCache::open(location, read_only)?)
        } else {
            None
        };
        let inner = CacheInner {
            location: location.to_path_buf(),
            max_total_bytes: self.config.max_total_bytes,
            max_entries: self.config.max_entries,
            read_only,
            header: HeaderStore::open(location, read_only)?,
            bodies: BodyStore::new(location),
            fast_cache,
            local: self.local.clone(),
            deletions: Default::default(),
            purge_requested: AtomicBool::new(false),
            completed: self.completed_tx.clone(),
        };

        match inner.header.load() {
            Ok(summary) => debug!(?summary, "Loaded texture cache header"),
            Err(e) if e.is_corruption() && !read_only => {
                warn!(error = %e, "Texture cache header is unusable, wiping the cache");
                inner.purge_all_textures(true)?;
            }
            Err(e) => return Err(e),
        }

        if !read_only {
            inner.bodies.create_dirs()?;
            inner.purge_textures(true);
            inner.header.write_updated_entries()?;
        }
        Ok(inner)
    }

    fn ready_inner(&self) -> Option<&Arc<CacheInner>> {
        match self.state {
            CacheState::Ready => self.inner.as_ref(),
            _ => None,
        }
    }

    fn issue(
        &self,
        kind: RequestKind,
        priority: Priority,
        job: Job,
        responder: Box<dyn Responder>,
    ) -> Handle {
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let worker = Arc::new(Worker::new(handle, job, responder));

        if self.ready_inner().is_some() {
            // Register before queueing so a fast worker can't finish before we know about it.
            self.workers.lock().map(kind).insert(handle, worker.clone());
            if self.queue.push(priority, worker.clone()) {
                return handle;
            }
            self.workers.lock().map(kind).remove(&handle);
        }

        worker.finish(false, None, &self.completed_tx);
        handle
    }

    /// Read `size` bytes of a cached texture from `offset`, or everything from `offset` if `size` is `None`.
    pub fn read_from_cache(
        &self,
        id: TextureId,
        priority: Priority,
        offset: u64,
        size: Option<u64>,
        responder: Box<dyn Responder>,
    ) -> Handle {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.issue(
            RequestKind::Read,
            priority,
            Job::Read { id, offset, size },
            responder,
        )
    }

    /// Store `data` as the body for `id`, replacing any previous body.
    ///
    /// `image_size` is the full size of the image, which may be more than `data` if only part of it is cached.  A
    /// `preview` goes to the fast cache.
    pub fn write_to_cache(
        &self,
        id: TextureId,
        priority: Priority,
        data: Vec<u8>,
        image_size: u32,
        preview: Option<FastCacheImage>,
        responder: Box<dyn Responder>,
    ) -> Handle {
        self.writes_issued.fetch_add(1, Ordering::Relaxed);
        self.issue(
            RequestKind::Write,
            priority,
            Job::Write {
                id,
                data,
                image_size,
                preview,
            },
            responder,
        )
    }

    /// Read a texture from a file outside the cache.  Relative paths resolve against the configured local root.
    pub fn read_from_file(
        &self,
        path: impl Into<PathBuf>,
        id: TextureId,
        priority: Priority,
        offset: u64,
        size: Option<u64>,
        responder: Box<dyn Responder>,
    ) -> Handle {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.issue(
            RequestKind::Read,
            priority,
            Job::ReadFile {
                path: path.into(),
                id,
                offset,
                size,
            },
            responder,
        )
    }

    fn complete(&self, kind: RequestKind, handle: Handle, abort: bool) -> bool {
        let mut workers = self.workers.lock();
        let worker = match workers.map(kind).get(&handle) {
            Some(w) => w.clone(),
            None => return true,
        };
        if abort {
            self.queue.remove(handle);
            if worker.abort() {
                workers.aborted.insert(handle);
            }
            workers.map(kind).remove(&handle);
            return true;
        }
        if worker.is_complete() {
            workers.map(kind).remove(&handle);
            return true;
        }
        false
    }

    /// True once the read is done, successfully or not.  With `abort`, give up on it: it completes immediately and
    /// its responder is never called.
    pub fn read_complete(&self, handle: Handle, abort: bool) -> bool {
        self.complete(RequestKind::Read, handle, abort)
    }

    /// As [TextureCache::read_complete], for writes.
    pub fn write_complete(&self, handle: Handle, abort: bool) -> bool {
        self.complete(RequestKind::Write, handle, abort)
    }

    /// Move a queued write to the front of its priority class.  Returns false if it isn't queued anymore.
    pub fn prioritize_write(&self, handle: Handle) -> bool {
        if !self.workers.lock().writers.contains_key(&handle) {
            return false;
        }
        self.queue.move_to_front(handle)
    }

    pub fn get_reader(&self, handle: Handle) -> Option<Arc<Worker>> {
        self.workers.lock().readers.get(&handle).cloned()
    }

    pub fn get_writer(&self, handle: Handle) -> Option<Arc<Worker>> {
        self.workers.lock().writers.get(&handle).cloned()
    }

    /// The status of an outstanding request.  `None` once it has been retired.
    pub fn request_status(&self, handle: Handle) -> Option<WorkerStatus> {
        self.get_reader(handle)
            .or_else(|| self.get_writer(handle))
            .map(|w| w.status())
    }

    /// Deliver finished requests to their responders, then spend what is left of `max_time` purging and flushing.
    ///
    /// Must be called regularly from the thread that owns the cache.  Returns how many responders were completed.
    pub fn update(&self, max_time: Duration) -> usize {
        let deadline = Instant::now() + max_time;
        let mut delivered = 0;
        while let Ok(Completion {
            handle,
            mut responder,
            success,
        }) = self.completed_rx.try_recv()
        {
            let aborted = {
                let mut workers = self.workers.lock();
                workers.readers.remove(&handle);
                workers.writers.remove(&handle);
                workers.aborted.remove(&handle)
            };
            if !aborted {
                responder.completed(success);
                delivered += 1;
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        let inner = match self.ready_inner() {
            Some(i) if !i.read_only => i,
            _ => return delivered,
        };
        if Instant::now() < deadline && inner.purge_requested.swap(false, Ordering::AcqRel) {
            inner.purge_textures(false);
        }
        let now = Instant::now();
        if now < deadline && !inner.deletions.is_empty() {
            let slice_end = deadline.min(now + self.config.purge_time_slice);
            inner.purge_texture_files_time_sliced(false, slice_end);
        }
        if Instant::now() < deadline {
            if let Err(e) = inner.header.write_updated_entries_until(Some(deadline)) {
                warn!(error = %e, "Failed to flush texture cache header");
            }
        }
        delivered
    }

    /// Drop the entry for `id`.  The body file is deleted later, from [TextureCache::update].
    pub fn remove_from_cache(&self, id: TextureId) -> bool {
        let inner = match self.ready_inner() {
            Some(i) if !i.read_only => i,
            _ => return false,
        };
        match inner.header.remove_entry(id) {
            Some(_) => {
                inner.deletions.push(id, inner.bodies.path_for(id));
                true
            }
            None => false,
        }
    }

    pub fn is_in_cache(&self, id: TextureId) -> bool {
        self.ready_inner()
            .map_or(false, |i| i.header.contains(id))
    }

    /// Whether a local file exists for `id` under the local root.
    pub fn is_in_local(&self, id: TextureId) -> bool {
        self.local.find(id).is_some()
    }

    /// Synchronously fetch the preview stored alongside a cached texture.
    pub fn read_from_fast_cache(&self, id: TextureId) -> Option<FastCacheImage> {
        let inner = self.ready_inner()?;
        let fast = inner.fast_cache.as_ref()?;
        let slot = inner.header.slot_of(id)?;
        match fast.read(slot, id) {
            Ok(image) => image,
            Err(e) => {
                debug!(%id, error = %e, "Fast cache read failed");
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            writes_issued: self.writes_issued.load(Ordering::Relaxed),
            max_bytes: self.config.max_total_bytes,
            max_entries: self.config.max_entries,
            ..Default::default()
        };
        if let Some(inner) = &self.inner {
            stats.bytes_used = inner.header.total_body_bytes();
            stats.entries = inner.header.len();
            stats.pending_deletions = inner.deletions.len();
            stats.pending_entry_writes = inner.header.pending_writes();
        }
        stats
    }

    /// Run a purge pass now rather than waiting for [TextureCache::update] to notice the cache is over budget.
    pub fn purge_textures(&self, validate: bool) -> PurgeResult {
        self.ready_inner()
            .map(|i| i.purge_textures(validate))
            .unwrap_or_default()
    }

    /// Delete queued body files for one time slice, or all of them with `force`.
    pub fn purge_texture_files_time_sliced(&self, force: bool) -> usize {
        let deadline = Instant::now() + self.config.purge_time_slice;
        self.ready_inner()
            .map_or(0, |i| i.purge_texture_files_time_sliced(force, deadline))
    }

    /// Throw away everything in the cache.
    pub fn purge_all_textures(&self, purge_directories: bool) -> Result<()> {
        let inner = self.ready_inner().ok_or(CacheError::NotReady)?;
        inner.purge_all_textures(purge_directories)
    }

    /// Delete a cache stored at `location`.  It must not be in use.
    pub fn purge_cache(location: impl AsRef<Path>) -> Result<()> {
        let location = location.as_ref();
        HeaderStore::remove_file(location)?;
        FastCache::remove_file(location)?;
        BodyStore::new(location).purge_all(true)?;
        info!(location = %location.display(), "Deleted texture cache");
        Ok(())
    }

    /// Stop the workers and flush everything to disk.
    ///
    /// Requests that never started fail; their responders still complete from [TextureCache::update].
    pub fn shutdown(&mut self) {
        if self.state == CacheState::Closed {
            return;
        }
        if let Some(mut pool) = self.pool.take() {
            for worker in pool.shutdown() {
                worker.finish(false, None, &self.completed_tx);
            }
        }
        if let Some(inner) = &self.inner {
            if !inner.read_only {
                if let Err(e) = inner.header.write_updated_entries() {
                    warn!(error = %e, "Failed to flush texture cache header on shutdown");
                }
                inner.purge_texture_files_time_sliced(true, Instant::now());
            }
            info!(location = %inner.location.display(), "Texture cache shut down");
        }
        self.state = CacheState::Closed;
    }
}

impl Drop for TextureCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, ThreadId};

    #[derive(Default)]
    struct Outcome {
        data: Option<TextureData>,
        success: Option<bool>,
        set_data_thread: Option<String>,
        completed_thread: Option<ThreadId>,
    }

    /// A responder which records what happened to it, including which thread did it.
    struct Recorder(Arc<Mutex<Outcome>>);

    impl Responder for Recorder {
        fn set_data(&mut self, data: TextureData) {
            let mut outcome = self.0.lock();
            outcome.data = Some(data);
            outcome.set_data_thread = thread::current().name().map(|n| n.to_string());
        }

        fn completed(&mut self, success: bool) {
            let mut outcome = self.0.lock();
            outcome.success = Some(success);
            outcome.completed_thread = Some(thread::current().id());
        }
    }

    fn recorder() -> (Box<dyn Responder>, Arc<Mutex<Outcome>>) {
        let outcome = Arc::new(Mutex::new(Outcome::default()));
        (Box::new(Recorder(outcome.clone())), outcome)
    }

    fn id(n: u8) -> TextureId {
        TextureId::from_bytes([n; 16])
    }

    fn config() -> CacheConfigBuilder {
        let mut builder = CacheConfigBuilder::default();
        builder.worker_threads(2);
        builder
    }

    fn open(dir: &Path, config: CacheConfig, max_bytes: u64) -> TextureCache {
        let mut cache = TextureCache::new(config);
        cache.init_cache(dir, max_bytes).expect("Should init");
        cache
    }

    /// Pump `update` until the responder completes, returning its success flag.
    fn wait(cache: &TextureCache, outcome: &Arc<Mutex<Outcome>>) -> bool {
        let start = Instant::now();
        loop {
            cache.update(Duration::from_millis(20));
            if let Some(s) = outcome.lock().success {
                return s;
            }
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "Timed out waiting for completion"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn write(cache: &TextureCache, id: TextureId, data: &[u8]) -> bool {
        let (r, outcome) = recorder();
        cache.write_to_cache(id, 0, data.to_vec(), data.len() as u32, None, r);
        wait(cache, &outcome)
    }

    fn read(cache: &TextureCache, id: TextureId) -> Option<Vec<u8>> {
        let (r, outcome) = recorder();
        cache.read_from_cache(id, 0, 0, None, r);
        if wait(cache, &outcome) {
            outcome.lock().data.take().map(|d| d.data)
        } else {
            None
        }
    }

    fn inner(cache: &TextureCache) -> &CacheInner {
        cache.inner.as_ref().unwrap()
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert_eq!(cache.state(), CacheState::Ready);

        let (r, outcome) = recorder();
        let h = cache.write_to_cache(id(1), 5, b"texture bytes".to_vec(), 4000, None, r);
        assert_ne!(h, Handle::NULL);
        assert!(wait(&cache, &outcome));
        assert!(cache.is_in_cache(id(1)));

        let (r, outcome) = recorder();
        cache.read_from_cache(id(1), 5, 0, None, r);
        assert!(wait(&cache, &outcome));
        let data = outcome.lock().data.take().unwrap();
        assert_eq!(data.data, b"texture bytes");
        assert_eq!(data.image_size, 4000);
        assert!(!data.local);

        // Partial reads clamp to what's stored.
        let (r, outcome) = recorder();
        cache.read_from_cache(id(1), 5, 8, Some(100), r);
        assert!(wait(&cache, &outcome));
        assert_eq!(outcome.lock().data.as_ref().unwrap().data, b"bytes");

        let stats = cache.stats();
        assert_eq!(stats.reads_issued, 2);
        assert_eq!(stats.writes_issued, 1);
        assert_eq!(stats.bytes_used, 13);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.max_bytes, 1 << 20);
    }

    #[test]
    fn test_misses_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert_eq!(read(&cache, id(9)), None);

        assert!(write(&cache, id(1), b"abc"));
        // Reading past the end is a miss too.
        let (r, outcome) = recorder();
        cache.read_from_cache(id(1), 0, 3, None, r);
        assert!(!wait(&cache, &outcome));
        assert!(outcome.lock().data.is_none());

        // So is a body which vanished from disk.
        fs::remove_file(inner(&cache).bodies.path_for(id(1))).unwrap();
        assert_eq!(read(&cache, id(1)), None);
    }

    #[test]
    fn test_invalid_writes_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(!write(&cache, id(1), b""));
        assert!(!write(&cache, TextureId::NIL, b"abc"));
        assert!(!cache.is_in_cache(id(1)));
        assert_eq!(cache.stats().bytes_used, 0);
    }

    #[test]
    fn test_completion_runs_on_update_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"abc"));

        let (r, outcome) = recorder();
        cache.read_from_cache(id(1), 0, 0, None, r);

        // Without update, nothing is ever completed even once the worker is done.
        let start = Instant::now();
        while outcome.lock().data.is_none() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(outcome.lock().success.is_none());

        assert!(wait(&cache, &outcome));
        let outcome = outcome.lock();
        assert_eq!(outcome.completed_thread, Some(thread::current().id()));
        assert!(outcome
            .set_data_thread
            .as_deref()
            .unwrap()
            .starts_with("texture-cache-"));
    }

    #[test]
    fn test_polling() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        let (r, outcome) = recorder();
        let h = cache.write_to_cache(id(1), 0, b"abc".to_vec(), 3, None, r);

        let start = Instant::now();
        while !cache.write_complete(h, false) {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        // Polled as complete, and retired, but the responder still hears about it from update.
        assert!(cache.get_writer(h).is_none());
        assert!(cache.request_status(h).is_none());
        assert!(wait(&cache, &outcome));

        // Unknown handles have nothing outstanding.
        assert!(cache.read_complete(Handle(12345), false));
        assert!(!cache.prioritize_write(Handle(12345)));
    }

    #[test]
    fn test_abort_suppresses_responder() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        for _ in 0..10 {
            let (r, outcome) = recorder();
            let h = cache.read_from_cache(id(1), 0, 0, None, r);
            assert!(cache.read_complete(h, true));
            assert!(cache.get_reader(h).is_none());

            for _ in 0..5 {
                cache.update(Duration::from_millis(5));
                thread::sleep(Duration::from_millis(1));
            }
            assert!(outcome.lock().success.is_none());
        }
        assert!(cache.workers.lock().aborted.is_empty());
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"one"));
        assert!(write(&cache, id(2), b"two"));
        let freed = inner(&cache).header.slot_of(id(1)).unwrap();
        let body = inner(&cache).bodies.path_for(id(1));

        assert!(cache.remove_from_cache(id(1)));
        assert!(!cache.remove_from_cache(id(1)));
        assert!(!cache.is_in_cache(id(1)));
        assert_eq!(cache.stats().bytes_used, 3);
        assert_eq!(cache.stats().pending_deletions, 1);

        cache.update(Duration::from_millis(50));
        assert!(!body.exists());
        assert_eq!(cache.stats().pending_deletions, 0);

        assert!(write(&cache, id(3), b"three"));
        assert_eq!(inner(&cache).header.slot_of(id(3)), Some(freed));
        assert_eq!(read(&cache, id(1)), None);
        assert_eq!(read(&cache, id(3)).unwrap(), b"three");
    }

    #[test]
    fn test_queued_deletion_skips_rewritten_texture() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"old"));
        assert!(cache.remove_from_cache(id(1)));
        // Written again before update got around to the deletion.
        let (r, outcome) = recorder();
        cache.write_to_cache(id(1), 0, b"new".to_vec(), 3, None, r);
        let start = Instant::now();
        while inner(&cache).header.body_size(id(1)).is_none() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(cache.purge_texture_files_time_sliced(true), 0);
        assert!(wait(&cache, &outcome));
        assert_eq!(read(&cache, id(1)).unwrap(), b"new");
    }

    #[test]
    fn test_lru_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().max_entries(3).build().unwrap(), 1 << 20);
        let (a, b, c, d) = (id(0xa), id(0xb), id(0xc), id(0xd));

        assert!(write(&cache, a, b"aaaa"));
        assert!(write(&cache, b, b"bbbb"));
        assert!(write(&cache, c, b"cccc"));
        assert_eq!(read(&cache, a).unwrap(), b"aaaa");
        assert_eq!(read(&cache, b).unwrap(), b"bbbb");
        assert!(write(&cache, d, b"dddd"));
        cache.update(Duration::from_millis(50));

        assert!(!cache.is_in_cache(c));
        assert_eq!(read(&cache, c), None);
        for (t, bytes) in &[(a, b"aaaa"), (b, b"bbbb"), (d, b"dddd")] {
            assert_eq!(read(&cache, *t).unwrap(), *bytes);
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.bytes_used, 12);
    }

    #[test]
    fn test_byte_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 100);
        for n in 1..=6 {
            assert!(write(&cache, id(n), &[n; 40]));
        }
        cache.update(Duration::from_millis(50));
        assert!(cache.stats().bytes_used <= 100);
        let result = cache.purge_textures(false);
        assert_eq!(result, PurgeResult::default());

        // The two newest survive.
        assert!(cache.is_in_cache(id(5)));
        assert!(cache.is_in_cache(id(6)));
        assert!(!cache.is_in_cache(id(4)));
        inner(&cache).header.assert_consistent();
    }

    #[test]
    fn test_accounting_under_load() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().worker_threads(4).build().unwrap(), 1 << 20);
        let mut outcomes = vec![];
        for n in 0..64u8 {
            let (r, outcome) = recorder();
            let data = vec![n; 10 + n as usize];
            cache.write_to_cache(id(n % 16 + 1), n as u32 % 3, data, 1000, None, r);
            outcomes.push(outcome);
        }
        for o in &outcomes {
            assert!(wait(&cache, o));
        }
        cache.update(Duration::from_millis(50));

        let inner = inner(&cache);
        inner.header.assert_consistent();
        assert_eq!(cache.stats().entries, 16);
        let mut on_disk = 0;
        for n in 1..=16 {
            let size = inner.bodies.file_size(id(n)).unwrap().unwrap();
            assert_eq!(inner.header.body_size(id(n)), Some(size as u32));
            on_disk += size;
        }
        assert_eq!(cache.stats().bytes_used, on_disk);
    }

    #[test]
    fn test_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
            assert!(write(&cache, id(1), b"persisted"));
            assert!(write(&cache, id(2), b"also"));
            assert!(cache.remove_from_cache(id(2)));
        }

        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(cache.is_in_cache(id(1)));
        assert!(!cache.is_in_cache(id(2)));
        assert_eq!(read(&cache, id(1)).unwrap(), b"persisted");
        assert_eq!(cache.stats().bytes_used, 9);
    }

    #[test]
    fn test_startup_validation_drops_bad_bodies() {
        let tmp = tempfile::tempdir().unwrap();
        let (missing, truncated) = {
            let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
            assert!(write(&cache, id(1), b"fine"));
            assert!(write(&cache, id(2), b"missing"));
            assert!(write(&cache, id(3), b"truncated"));
            (
                inner(&cache).bodies.path_for(id(2)),
                inner(&cache).bodies.path_for(id(3)),
            )
        };
        fs::remove_file(missing).unwrap();
        fs::write(truncated, b"trunc").unwrap();

        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(cache.is_in_cache(id(1)));
        assert!(!cache.is_in_cache(id(2)));
        assert!(!cache.is_in_cache(id(3)));
        assert_eq!(cache.stats().bytes_used, 4);
    }

    #[test]
    fn test_corrupt_header_wipes_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let body = {
            let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
            assert!(write(&cache, id(1), b"doomed"));
            inner(&cache).bodies.path_for(id(1))
        };
        assert!(body.exists());

        let header = tmp.path().join(HEADER_FILE_NAME);
        let mut bytes = fs::read(&header).unwrap();
        bytes[0] = 99;
        fs::write(&header, &bytes).unwrap();

        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(!cache.is_in_cache(id(1)));
        assert!(!body.exists());
        assert_eq!(cache.stats().entries, 0);
        assert!(write(&cache, id(2), b"fresh start"));
    }

    #[test]
    fn test_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
            assert!(write(&cache, id(1), b"existing"));
        }
        let header_bytes = fs::read(tmp.path().join(HEADER_FILE_NAME)).unwrap();

        let cache = open(tmp.path(), config().read_only(true).build().unwrap(), 1 << 20);
        assert_eq!(read(&cache, id(1)).unwrap(), b"existing");
        assert!(!write(&cache, id(2), b"new"));
        assert!(!cache.remove_from_cache(id(1)));
        assert!(cache.purge_all_textures(false).is_err());
        drop(cache);
        assert_eq!(
            fs::read(tmp.path().join(HEADER_FILE_NAME)).unwrap(),
            header_bytes
        );

        // A read-only cache over nothing at all is just empty.
        let empty = tmp.path().join("nothing");
        let cache = open(&empty, config().read_only(true).build().unwrap(), 1 << 20);
        assert_eq!(read(&cache, id(1)), None);
        drop(cache);
        assert!(!empty.exists());
    }

    #[test]
    fn test_read_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let skins = tmp.path().join("skins");
        fs::create_dir(&skins).unwrap();
        fs::write(skins.join(format!("{}.png", id(7))), b"local pixels").unwrap();

        let cfg = config().local_root(skins.clone()).build().unwrap();
        let cache = open(&tmp.path().join("cache"), cfg, 1 << 20);
        assert!(cache.is_in_local(id(7)));
        assert!(!cache.is_in_local(id(8)));

        let (r, outcome) = recorder();
        cache.read_from_file(format!("{}.png", id(7)), id(7), 0, 6, None, r);
        assert!(wait(&cache, &outcome));
        let data = outcome.lock().data.take().unwrap();
        assert_eq!(data.data, b"pixels");
        assert_eq!(data.image_size, 12);
        assert!(data.local);

        let (r, outcome) = recorder();
        cache.read_from_file("../escape.png", id(7), 0, 0, None, r);
        assert!(!wait(&cache, &outcome));
        // Local reads don't populate the cache.
        assert!(!cache.is_in_cache(id(7)));
    }

    #[test]
    fn test_fast_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        let preview = FastCacheImage {
            width: 2,
            height: 2,
            components: 1,
            discard_level: 4,
            data: vec![1, 2, 3, 4],
        };
        let (r, outcome) = recorder();
        cache.write_to_cache(id(1), 0, b"full".to_vec(), 4, Some(preview.clone()), r);
        assert!(wait(&cache, &outcome));
        assert_eq!(cache.read_from_fast_cache(id(1)), Some(preview));
        assert_eq!(cache.read_from_fast_cache(id(2)), None);

        assert!(cache.remove_from_cache(id(1)));
        assert_eq!(cache.read_from_fast_cache(id(1)), None);
        // The slot is reused without a preview; the stale one must not leak through.
        assert!(write(&cache, id(2), b"other"));
        assert_eq!(cache.read_from_fast_cache(id(2)), None);

        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().fast_cache(false).build().unwrap(), 1 << 20);
        assert!(!tmp.path().join(FAST_CACHE_FILE_NAME).exists());
        assert_eq!(cache.read_from_fast_cache(id(1)), None);
    }

    #[test]
    fn test_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = TextureCache::new(config().build().unwrap());
        assert_eq!(cache.state(), CacheState::Uninitialized);

        // Requests before init fail, but still complete through update.
        let (r, outcome) = recorder();
        cache.read_from_cache(id(1), 0, 0, None, r);
        assert!(!wait(&cache, &outcome));
        assert!(!cache.is_in_cache(id(1)));

        assert_eq!(cache.init_cache(tmp.path(), 4096).unwrap(), 4096);
        assert!(matches!(
            cache.init_cache(tmp.path(), 4096),
            Err(CacheError::AlreadyInitialized)
        ));
        assert!(write(&cache, id(1), b"abc"));

        cache.shutdown();
        assert_eq!(cache.state(), CacheState::Closed);
        let (r, outcome) = recorder();
        cache.write_to_cache(id(2), 0, b"late".to_vec(), 4, None, r);
        assert!(!wait(&cache, &outcome));
        // Shutting down twice is fine.
        cache.shutdown();
    }

    #[test]
    fn test_purge_all_and_purge_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"abc"));
        assert!(write(&cache, id(2), b"def"));

        cache.purge_all_textures(false).unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes_used, 0);
        assert!(!inner(&cache).bodies.path_for(id(1)).exists());
        assert!(write(&cache, id(3), b"ghi"));
        drop(cache);

        TextureCache::purge_cache(tmp.path()).unwrap();
        assert!(!tmp.path().join(HEADER_FILE_NAME).exists());
        assert!(!tmp.path().join(FAST_CACHE_FILE_NAME).exists());
        assert!(!tmp.path().join(TEXTURES_DIR).exists());

        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(!cache.is_in_cache(id(3)));
    }

    #[test]
    fn test_bad_preview_fails_write_without_stalling() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().worker_threads(1).build().unwrap(), 1 << 20);
        assert!(write(&cache, id(2), b"other"));

        let huge = FastCacheImage {
            width: u32::MAX,
            height: u32::MAX,
            components: u32::MAX,
            discard_level: 0,
            data: vec![0; 16],
        };
        let (r, outcome) = recorder();
        cache.write_to_cache(id(1), 0, b"body".to_vec(), 4, Some(huge), r);
        assert!(!wait(&cache, &outcome));

        // Rejected before anything reached the disk.
        assert!(!cache.is_in_cache(id(1)));
        assert!(!inner(&cache).bodies.path_for(id(1)).exists());
        assert_eq!(cache.stats().bytes_used, 5);
        // And the only worker is still there.
        assert_eq!(read(&cache, id(2)).unwrap(), b"other");
    }

    struct Panicky;

    impl Responder for Panicky {
        fn set_data(&mut self, _data: TextureData) {
            panic!("responder blew up");
        }

        fn completed(&mut self, _success: bool) {}
    }

    #[test]
    fn test_panicking_responder_does_not_kill_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().worker_threads(1).build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"abc"));

        let h = cache.read_from_cache(id(1), 0, 0, None, Box::new(Panicky));
        assert_eq!(read(&cache, id(1)).unwrap(), b"abc");
        assert!(cache.read_complete(h, false));
    }

    #[test]
    fn test_failed_write_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        assert!(write(&cache, id(0x11), b"kept"));
        let before = cache.stats();

        // Bodies for id(1) live under textures/0.  Put a file there so nothing can be written.
        let sub = tmp.path().join(TEXTURES_DIR).join("0");
        fs::remove_dir(&sub).unwrap();
        fs::write(&sub, b"in the way").unwrap();

        let (r, outcome) = recorder();
        cache.write_to_cache(id(1), 0, b"lost".to_vec(), 4, None, r);
        assert!(!wait(&cache, &outcome));
        assert!(!cache.is_in_cache(id(1)));
        let after = cache.stats();
        assert_eq!(after.bytes_used, before.bytes_used);
        assert_eq!(after.entries, 1);
        inner(&cache).header.assert_consistent();
        assert_eq!(read(&cache, id(0x11)).unwrap(), b"kept");
    }

    /// Holds its worker inside `set_data` until released.
    struct Gate(crossbeam::channel::Receiver<()>);

    impl Responder for Gate {
        fn set_data(&mut self, _data: TextureData) {
            let _ = self.0.recv_timeout(Duration::from_secs(10));
        }

        fn completed(&mut self, _success: bool) {}
    }

    /// Appends its tag to a shared log when completed.
    struct Logged(u8, Arc<Mutex<Vec<u8>>>);

    impl Responder for Logged {
        fn set_data(&mut self, _data: TextureData) {}

        fn completed(&mut self, _success: bool) {
            self.1.lock().push(self.0);
        }
    }

    #[test]
    fn test_prioritize_write() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().worker_threads(1).build().unwrap(), 1 << 20);
        assert!(write(&cache, id(1), b"abc"));

        // Park the only worker so the writes below stay queued.
        let (release, gate) = crossbeam::channel::bounded(1);
        cache.read_from_cache(id(1), 10, 0, None, Box::new(Gate(gate)));

        let log = Arc::new(Mutex::new(vec![]));
        let handles = (2..=4u8)
            .map(|n| {
                cache.write_to_cache(id(n), 1, vec![n; 4], 4, None, Box::new(Logged(n, log.clone())))
            })
            .collect::<Vec<_>>();
        assert!(cache.prioritize_write(handles[2]));
        assert!(!cache.prioritize_write(Handle(12345)));
        release.send(()).unwrap();

        let start = Instant::now();
        while log.lock().len() < 3 {
            assert!(start.elapsed() < Duration::from_secs(10));
            cache.update(Duration::from_millis(20));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*log.lock(), vec![4, 2, 3]);
        assert!(!cache.prioritize_write(handles[2]));
    }

    #[test]
    fn test_update_respects_time_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().build().unwrap(), 1 << 20);
        let header = &inner(&cache).header;
        let count = 50_000u32;
        for n in 1..=count {
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&n.to_le_bytes());
            header
                .open_and_read_entry(TextureId::from_bytes(bytes), true)
                .unwrap();
        }
        assert_eq!(cache.stats().pending_entry_writes, count as usize);

        let start = Instant::now();
        cache.update(Duration::from_millis(1));
        let elapsed = start.elapsed();
        let pending = cache.stats().pending_entry_writes;
        assert!(pending > 0 && pending < count as usize, "pending = {}", pending);
        assert!(elapsed < Duration::from_millis(500), "update took {:?}", elapsed);

        // Later calls pick up where the last one stopped.
        let start = Instant::now();
        while cache.stats().pending_entry_writes > 0 {
            assert!(start.elapsed() < Duration::from_secs(30));
            cache.update(Duration::from_millis(5));
        }
        assert_eq!(header.read_entries_header().unwrap(), EntriesInfo::new(count));
    }

    #[test]
    fn test_reads_see_whole_bodies_during_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), config().worker_threads(4).build().unwrap(), 1 << 20);
        let short = vec![1u8; 10];
        let long = vec![2u8; 20];
        assert!(write(&cache, id(1), &short));

        let mut reads = vec![];
        let mut writes = vec![];
        for n in 0..100 {
            let (r, outcome) = recorder();
            let body = if n % 2 == 0 { long.clone() } else { short.clone() };
            cache.write_to_cache(id(1), 0, body, 20, None, r);
            writes.push(outcome);
            let (r, outcome) = recorder();
            cache.read_from_cache(id(1), 0, 0, None, r);
            reads.push(outcome);
        }
        for o in &writes {
            assert!(wait(&cache, o));
        }
        for o in &reads {
            if wait(&cache, o) {
                let data = o.lock().data.take().unwrap().data;
                assert!(data == short || data == long, "torn read of {} bytes", data.len());
            }
        }
        inner(&cache).header.assert_consistent();
    }
}
