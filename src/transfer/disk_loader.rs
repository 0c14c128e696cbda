//! Background disk loader.
//!
//! Byte-range file reads are queued from any thread and serviced in
//! submission order by one dedicated worker thread. Callers collect
//! results by blocking ([`DiskLoader::sync_request`]), polling
//! ([`DiskLoader::try_sync_request`]) or awaiting ([`DiskLoader::wait`]).
//!
//! Writers that rewrite files the loader may be reading take
//! [`DiskLoader::lock`]: it blocks new submissions and returns only once
//! every previously queued request has completed.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::transfer::request_pool::{RequestId, RequestPool};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("disk loader worker is not running")]
    NotRunning,

    #[error("load request {0} is unknown or was already collected")]
    StaleHandle(RequestId),

    #[error("load request {0} was still queued when the loader stopped")]
    Stopped(RequestId),

    #[error("failed to spawn loader worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Priority tag of a load request.
///
/// Recorded with every request, but the worker services requests strictly
/// in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LoadPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Outcome of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    /// Bytes read from the file. Fewer than requested on a short read,
    /// empty when the offset is at or past the end of the file.
    Loaded(Vec<u8>),

    /// The file could not be opened.
    FileMissing,
}

impl LoadResult {
    /// Number of bytes read, `None` if the file was missing.
    pub fn bytes_read(&self) -> Option<usize> {
        match self {
            LoadResult::Loaded(data) => Some(data.len()),
            LoadResult::FileMissing => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            LoadResult::Loaded(data) => Some(data),
            LoadResult::FileMissing => None,
        }
    }
}

/// A queued byte-range read.
#[derive(Debug, Clone)]
struct LoadRequest {
    path: PathBuf,
    offset: u64,
    size: usize,
    priority: LoadPriority,
}

#[derive(Debug)]
enum RequestState {
    Queued(LoadRequest),
    InFlight,
    Complete(LoadResult),
}

#[derive(Debug)]
struct LoaderState {
    pool: RequestPool<RequestState>,
    queue: VecDeque<RequestId>,
    busy: bool,
    running: bool,
    stopping: bool,
}

impl LoaderState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.busy
    }

    /// Collect a request if it is complete. `Ok(None)` while pending.
    fn collect(&mut self, id: RequestId) -> Result<Option<LoadResult>, LoadError> {
        match self.pool.get(id) {
            None => Err(LoadError::StaleHandle(id)),
            Some(RequestState::Complete(_)) => match self.pool.remove(id) {
                Some(RequestState::Complete(result)) => Ok(Some(result)),
                _ => Err(LoadError::StaleHandle(id)),
            },
            Some(RequestState::Queued(_)) if self.stopping => {
                self.pool.remove(id);
                self.queue.retain(|queued| *queued != id);
                Err(LoadError::Stopped(id))
            }
            Some(_) => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
struct LoaderStats {
    requests_queued: AtomicU64,
    requests_completed: AtomicU64,
    bytes_read: AtomicU64,
    missing_files: AtomicU64,
    short_reads: AtomicU64,
}

/// Point-in-time copy of the loader counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatsSnapshot {
    pub requests_queued: u64,
    pub requests_completed: u64,
    pub bytes_read: u64,
    pub missing_files: u64,
    pub short_reads: u64,
}

struct Shared {
    state: Mutex<LoaderState>,

    /// Signalled when work is queued or the worker should stop.
    work_ready: Condvar,

    /// Signalled after every completion and when the worker exits.
    progress: Condvar,

    /// Submissions take the read side; `lock()` takes the write side.
    submit_gate: RwLock<()>,

    /// Wakes async waiters after every completion.
    completions: Notify,

    stats: LoaderStats,
}

/// Single-worker background file reader.
pub struct DiskLoader {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_name: String,
}

/// Exclusive access to the files the loader reads. Dropping it unlocks.
#[must_use = "the loader is unlocked as soon as the guard is dropped"]
pub struct LoaderLock<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
}

impl DiskLoader {
    /// Create a loader. No worker runs until [`DiskLoader::start`].
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoaderState {
                    pool: RequestPool::with_capacity(config.request_pool_capacity),
                    queue: VecDeque::new(),
                    busy: false,
                    running: false,
                    stopping: false,
                }),
                work_ready: Condvar::new(),
                progress: Condvar::new(),
                submit_gate: RwLock::new(()),
                completions: Notify::new(),
                stats: LoaderStats::default(),
            }),
            worker: Mutex::new(None),
            worker_name: config.worker_name.clone(),
        }
    }

    /// Create and start a loader.
    pub fn start_new(config: &LoaderConfig) -> Result<Arc<Self>, LoadError> {
        let loader = Arc::new(Self::new(config));
        loader.start()?;
        Ok(loader)
    }

    /// Spawn the worker thread. Starting a running loader is a no-op.
    pub fn start(&self) -> Result<(), LoadError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock();
            state.running = true;
            state.stopping = false;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.worker_name.clone())
            .spawn(move || run_worker(shared))
            .map_err(|err| {
                self.shared.state.lock().running = false;
                LoadError::Spawn(err)
            })?;

        info!(worker = %self.worker_name, "Disk loader started");
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        let state = self.shared.state.lock();
        state.running && !state.stopping
    }

    /// Queue a read of up to `size` bytes at `offset` in `path`.
    pub fn queue_request(
        &self,
        path: impl Into<PathBuf>,
        offset: u64,
        size: usize,
        priority: LoadPriority,
    ) -> Result<RequestId, LoadError> {
        let _gate = self.shared.submit_gate.read();

        let request = LoadRequest {
            path: path.into(),
            offset,
            size,
            priority,
        };

        let mut state = self.shared.state.lock();
        if !state.running || state.stopping {
            return Err(LoadError::NotRunning);
        }

        debug!(
            path = %request.path.display(),
            offset,
            size,
            priority = ?request.priority,
            "Queued load request"
        );

        let id = state.pool.insert(RequestState::Queued(request));
        state.queue.push_back(id);
        drop(state);

        self.shared.stats.requests_queued.fetch_add(1, Ordering::Relaxed);
        self.shared.work_ready.notify_one();

        Ok(id)
    }

    /// Block until a request completes, then release it.
    pub fn sync_request(&self, id: RequestId) -> Result<LoadResult, LoadError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.collect(id)? {
                return Ok(result);
            }
            self.shared.progress.wait(&mut state);
        }
    }

    /// Collect a request if it has completed. Returns `Ok(None)` and keeps
    /// the request allocated while it is still pending.
    pub fn try_sync_request(&self, id: RequestId) -> Result<Option<LoadResult>, LoadError> {
        self.shared.state.lock().collect(id)
    }

    /// Await a request's completion, then release it.
    pub async fn wait(&self, id: RequestId) -> Result<LoadResult, LoadError> {
        loop {
            let notified = self.shared.completions.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_sync_request(id)? {
                return Ok(result);
            }
            notified.await;
        }
    }

    /// Block until the queue is empty and the worker is idle.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !state.is_idle() && state.running && !state.stopping {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Block new submissions and wait for every queued request to finish.
    ///
    /// Must not be called while the same thread still has to queue
    /// requests before releasing the guard.
    pub fn lock(&self) -> LoaderLock<'_> {
        let gate = self.shared.submit_gate.write();
        self.flush();
        LoaderLock { _gate: gate }
    }

    /// Stop the worker after the request it is currently servicing.
    ///
    /// Requests still queued are not serviced; collecting them reports
    /// [`LoadError::Stopped`].
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.stopping = true;
        }
        self.shared.work_ready.notify_all();
        self.shared.progress.notify_all();
        self.shared.completions.notify_waiters();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(worker = %self.worker_name, "Disk loader worker panicked");
            }
        }
        info!(worker = %self.worker_name, "Disk loader stopped");
    }

    /// Number of requests queued but not yet picked up by the worker.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn stats(&self) -> LoaderStatsSnapshot {
        let stats = &self.shared.stats;
        LoaderStatsSnapshot {
            requests_queued: stats.requests_queued.load(Ordering::Relaxed),
            requests_completed: stats.requests_completed.load(Ordering::Relaxed),
            bytes_read: stats.bytes_read.load(Ordering::Relaxed),
            missing_files: stats.missing_files.load(Ordering::Relaxed),
            short_reads: stats.short_reads.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DiskLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DiskLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLoader")
            .field("worker_name", &self.worker_name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let (id, request) = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.stopping {
                shared.work_ready.wait(&mut state);
            }
            if state.stopping {
                break;
            }

            let Some(id) = state.queue.pop_front() else {
                continue;
            };
            let request = match state.pool.get_mut(id) {
                Some(slot) => match std::mem::replace(slot, RequestState::InFlight) {
                    RequestState::Queued(request) => request,
                    other => {
                        *slot = other;
                        continue;
                    }
                },
                None => continue,
            };
            state.busy = true;
            (id, request)
        };

        let result = read_range(&request, &shared.stats);

        {
            let mut state = shared.state.lock();
            if let Some(slot) = state.pool.get_mut(id) {
                *slot = RequestState::Complete(result);
            }
            state.busy = false;
        }
        shared.stats.requests_completed.fetch_add(1, Ordering::Relaxed);
        shared.progress.notify_all();
        shared.completions.notify_waiters();

        thread::yield_now();
    }

    let mut state = shared.state.lock();
    state.running = false;
    state.busy = false;
    drop(state);
    shared.progress.notify_all();
    shared.completions.notify_waiters();
}

/// Perform one request's read on the worker thread.
fn read_range(request: &LoadRequest, stats: &LoaderStats) -> LoadResult {
    let mut file = match File::open(&request.path) {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %request.path.display(), error = %err, "Load request file missing");
            stats.missing_files.fetch_add(1, Ordering::Relaxed);
            return LoadResult::FileMissing;
        }
    };

    // The buffer never grows past what the file holds from the offset.
    let available = match file.metadata() {
        Ok(meta) if request.offset >= meta.len() => return LoadResult::Loaded(Vec::new()),
        Ok(meta) => usize::try_from(meta.len() - request.offset).unwrap_or(usize::MAX),
        Err(_) => 0,
    };

    match file.seek(SeekFrom::Start(request.offset)) {
        Ok(pos) if pos == request.offset => {}
        _ => {
            debug!(path = %request.path.display(), offset = request.offset, "Seek mismatch, returning no data");
            return LoadResult::Loaded(Vec::new());
        }
    }

    let mut data = Vec::with_capacity(request.size.min(available));
    if let Err(err) = (&mut file).take(request.size as u64).read_to_end(&mut data) {
        warn!(path = %request.path.display(), error = %err, read = data.len(), "Read failed part way");
    }

    if data.len() < request.size {
        stats.short_reads.fetch_add(1, Ordering::Relaxed);
    }
    stats.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);

    debug!(
        path = %request.path.display(),
        offset = request.offset,
        requested = request.size,
        read = data.len(),
        "Completed load request"
    );

    LoadResult::Loaded(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn test_queue_requires_started_worker() {
        let loader = DiskLoader::new(&LoaderConfig::default());
        let err = loader
            .queue_request("/tmp/whatever", 0, 4, LoadPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, LoadError::NotRunning));
    }

    #[test]
    fn test_read_range() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "data.bin", &(0u8..100).collect::<Vec<_>>());
        let loader = DiskLoader::start_new(&LoaderConfig::default()).unwrap();

        let id = loader.queue_request(&path, 10, 5, LoadPriority::High).unwrap();
        let result = loader.sync_request(id).unwrap();
        assert_eq!(result, LoadResult::Loaded(vec![10, 11, 12, 13, 14]));

        // The handle is released after collection.
        assert!(matches!(loader.sync_request(id), Err(LoadError::StaleHandle(_))));
    }

    #[test]
    fn test_short_read_and_past_end() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "short.bin", &[1, 2, 3]);
        let loader = DiskLoader::start_new(&LoaderConfig::default()).unwrap();

        let short = loader.queue_request(&path, 1, 100, LoadPriority::Normal).unwrap();
        let past = loader.queue_request(&path, 3, 10, LoadPriority::Normal).unwrap();

        assert_eq!(loader.sync_request(short).unwrap().bytes_read(), Some(2));
        assert_eq!(loader.sync_request(past).unwrap().bytes_read(), Some(0));
        assert_eq!(loader.stats().short_reads, 1);
    }

    #[test]
    fn test_stop_rejects_new_requests() {
        let loader = DiskLoader::start_new(&LoaderConfig::default()).unwrap();
        assert!(loader.is_running());
        loader.stop();
        assert!(!loader.is_running());
        assert!(matches!(
            loader.queue_request("/tmp/x", 0, 1, LoadPriority::Low),
            Err(LoadError::NotRunning)
        ));
    }
}
