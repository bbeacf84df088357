use crate::{
    config::ChannelConfig,
    error::{ModError, OpResult},
    identity::identity_hash,
    library::{CleanPlan, DownloadPlan, InstallPlan, LibraryIndex, RestorePlan},
    net::{
        download_dest, DownloadEvents, DownloadRequest, Downloader, HttpDownloader,
        HttpRepoQuerier, RepoQuerier,
    },
};
use anyhow::Result;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

const DOWNLOAD_PACING: Duration = Duration::from_millis(100);

/// Caller-side callbacks for queued work.
///
/// `on_progress` runs while the worker holds the library, so it must not call
/// back into the channel. Returning false requests an abort of the whole queue.
pub trait OpHandler: Send + Sync {
    fn on_begin(&self, _hash: u64) {}

    fn on_progress(&self, _hash: u64, _current: u64, _total: u64) -> bool {
        true
    }

    fn on_result(&self, hash: u64, result: OpResult);
}

/// What a queue is being used for. Mod operations and supersedes share the
/// mod-library lock; downloads and repository queries share the net lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockIntent {
    ModOps,
    Supersede,
    Download,
    Query,
}

impl LockIntent {
    fn uses_mod_lock(self) -> bool {
        matches!(self, LockIntent::ModOps | LockIntent::Supersede)
    }
}

#[derive(Clone)]
struct QueuedItem {
    hash: u64,
    target: String,
    progress: Arc<AtomicU32>,
}

struct QueueState {
    pending: VecDeque<QueuedItem>,
    current: Vec<QueuedItem>,
    done: usize,
    handler: Option<Arc<dyn OpHandler>>,
    exit_code: OpResult,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            current: Vec::new(),
            done: 0,
            handler: None,
            exit_code: OpResult::Ok,
        }
    }
}

#[derive(Default)]
struct OpQueue {
    state: Mutex<QueueState>,
    abort: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct ChannelInner {
    library: Mutex<LibraryIndex>,
    mod_lock: Mutex<Option<LockIntent>>,
    net_lock: Mutex<Option<LockIntent>>,
    mod_ops: OpQueue,
    supersede: OpQueue,
    download: OpQueue,
    query: OpQueue,
    downloader: Arc<dyn Downloader>,
    querier: Arc<dyn RepoQuerier>,
    deferred: Mutex<Vec<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_handler(a: &Arc<dyn OpHandler>, b: &Arc<dyn OpHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ChannelInner {
    fn queue(&self, intent: LockIntent) -> &OpQueue {
        match intent {
            LockIntent::ModOps => &self.mod_ops,
            LockIntent::Supersede => &self.supersede,
            LockIntent::Download => &self.download,
            LockIntent::Query => &self.query,
        }
    }

    fn lock_slot(&self, intent: LockIntent) -> &Mutex<Option<LockIntent>> {
        if intent.uses_mod_lock() {
            &self.mod_lock
        } else {
            &self.net_lock
        }
    }

    fn deliver_download(&self, path: PathBuf) {
        let mod_lock = lock(&self.mod_lock);
        if mod_lock.is_some() {
            debug!("deferring download {:?}", path);
            lock(&self.deferred).push(path);
            return;
        }
        let mut library = lock(&self.library);
        if let Err(err) = library.add_source(&path) {
            warn!("downloaded file {:?} not added: {}", path, crate::error::summarize(&err));
        }
    }

    fn flush_deferred(&self, library: &mut LibraryIndex) {
        let paths: Vec<PathBuf> = lock(&self.deferred).drain(..).collect();
        for path in paths {
            if let Err(err) = library.add_source(&path) {
                warn!("downloaded file {:?} not added: {}", path, crate::error::summarize(&err));
            }
        }
    }
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        downloader: Arc<dyn Downloader>,
        querier: Arc<dyn RepoQuerier>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                library: Mutex::new(LibraryIndex::new(config)),
                mod_lock: Mutex::new(None),
                net_lock: Mutex::new(None),
                mod_ops: OpQueue::default(),
                supersede: OpQueue::default(),
                download: OpQueue::default(),
                query: OpQueue::default(),
                downloader,
                querier,
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn open(config: ChannelConfig) -> Result<Self> {
        let channel = Self::new(
            config,
            Arc::new(HttpDownloader::new()),
            Arc::new(HttpRepoQuerier::new()),
        );
        channel.refresh()?;
        Ok(channel)
    }

    pub fn with_library<R>(&self, f: impl FnOnce(&LibraryIndex) -> R) -> R {
        let library = lock(&self.inner.library);
        f(&library)
    }

    /// Caller-side mutation; refused while a mod queue holds the library.
    pub fn with_library_mut<R>(&self, f: impl FnOnce(&mut LibraryIndex) -> R) -> Result<R> {
        let mod_lock = lock(&self.inner.mod_lock);
        if mod_lock.is_some() {
            return Err(ModError::Locked.into());
        }
        let mut library = lock(&self.inner.library);
        Ok(f(&mut library))
    }

    pub fn refresh(&self) -> Result<()> {
        self.with_library_mut(|library| library.refresh())?
    }

    pub fn notify_created(&self, path: &Path) -> Result<bool> {
        match self.with_library_mut(|library| library.notify_created(path)) {
            Ok(changed) => changed,
            Err(_) => {
                debug!("library locked, ignoring created {:?}", path);
                Ok(false)
            }
        }
    }

    pub fn notify_deleted(&self, path: &Path) -> bool {
        self.with_library_mut(|library| library.notify_deleted(path))
            .unwrap_or_else(|_| {
                debug!("library locked, ignoring deleted {:?}", path);
                false
            })
    }

    pub fn prepare_installs(&self, selection: &[u64]) -> Result<InstallPlan> {
        self.with_library_mut(|library| library.prepare_installs(selection))
    }

    pub fn prepare_restores(&self, selection: &[u64]) -> RestorePlan {
        self.with_library(|library| library.prepare_restores(selection))
    }

    pub fn prepare_cleaning(&self, selection: &[u64]) -> CleanPlan {
        self.with_library(|library| library.prepare_cleaning(selection))
    }

    pub fn prepare_downloads(&self, selection: &[u64]) -> DownloadPlan {
        self.with_library(|library| library.prepare_downloads(selection))
    }

    pub fn is_locked(&self, intent: LockIntent) -> bool {
        lock(self.inner.lock_slot(intent)).is_some()
    }

    pub fn queue_mod_ops(&self, hashes: &[u64], handler: Arc<dyn OpHandler>) -> bool {
        self.enqueue(LockIntent::ModOps, hashes, Vec::new(), handler)
    }

    pub fn queue_supersedes(&self, hashes: &[u64], handler: Arc<dyn OpHandler>) -> bool {
        self.enqueue(LockIntent::Supersede, hashes, Vec::new(), handler)
    }

    pub fn queue_downloads(&self, hashes: &[u64], handler: Arc<dyn OpHandler>) -> bool {
        self.enqueue(LockIntent::Download, hashes, Vec::new(), handler)
    }

    /// Fetches repository catalogs. Results are keyed by `identity_hash(url)`.
    pub fn queue_queries(&self, urls: &[String], handler: Arc<dyn OpHandler>) -> bool {
        let hashes: Vec<u64> = urls.iter().map(|url| identity_hash(url)).collect();
        self.enqueue(LockIntent::Query, &hashes, urls.to_vec(), handler)
    }

    fn enqueue(
        &self,
        intent: LockIntent,
        hashes: &[u64],
        targets: Vec<String>,
        handler: Arc<dyn OpHandler>,
    ) -> bool {
        let inner = &self.inner;
        let mut slot = lock(inner.lock_slot(intent));
        if let Some(holder) = *slot {
            if holder != intent {
                drop(slot);
                warn!(?intent, ?holder, "queue rejected, library locked");
                for hash in hashes {
                    handler.on_result(*hash, OpResult::Abort);
                }
                return false;
            }
        }

        let queue = inner.queue(intent);
        let mut state = lock(&queue.state);
        let starting = slot.is_none();
        if starting {
            state.done = 0;
            state.current.clear();
            state.exit_code = OpResult::Ok;
            state.handler = Some(handler);
            queue.abort.store(false, Ordering::Relaxed);
        } else if let Some(existing) = &state.handler {
            if !same_handler(existing, &handler) {
                warn!(?intent, "appending with a different handler, keeping the original");
            }
        }

        {
            let library = lock(&inner.library);
            for (i, hash) in hashes.iter().enumerate() {
                let progress = match intent {
                    LockIntent::ModOps | LockIntent::Supersede => {
                        library.find_by_hash(*hash).map(|pkg| pkg.progress_handle())
                    }
                    LockIntent::Download => {
                        library.find_net_by_hash(*hash).map(|pkg| pkg.progress_handle())
                    }
                    LockIntent::Query => None,
                };
                let progress = progress.unwrap_or_else(|| Arc::new(AtomicU32::new(0)));
                progress.store(0, Ordering::Relaxed);
                state.pending.push_back(QueuedItem {
                    hash: *hash,
                    target: targets.get(i).cloned().unwrap_or_default(),
                    progress,
                });
            }
        }
        info!(?intent, added = hashes.len(), queued = state.pending.len(), "queued");

        if starting {
            *slot = Some(intent);
            let worker_inner = Arc::clone(inner);
            let handle = match intent {
                LockIntent::Download => thread::spawn(move || run_download_starter(worker_inner)),
                _ => thread::spawn(move || run_worker(worker_inner, intent)),
            };
            *lock(&queue.worker) = Some(handle);
        }
        true
    }

    /// Requests cooperative cancellation. Queued items drain as aborted; running
    /// downloads stop one at a time, starting with the most recent.
    pub fn abort(&self, intent: LockIntent) {
        let queue = self.inner.queue(intent);
        queue.abort.store(true, Ordering::Relaxed);
        if intent == LockIntent::Download {
            let last = lock(&queue.state).current.last().map(|item| item.hash);
            if let Some(hash) = last {
                self.inner.downloader.stop(hash);
            }
        }
    }

    pub fn percent(&self, intent: LockIntent) -> u32 {
        let state = lock(&self.inner.queue(intent).state);
        let remaining = state.current.len() + state.pending.len();
        let total = state.done + remaining;
        if total == 0 {
            return 0;
        }
        let live: u64 = state
            .current
            .iter()
            .chain(state.pending.iter())
            .map(|item| u64::from(item.progress.load(Ordering::Relaxed).min(100)))
            .sum();
        ((100 * state.done as u64 + live) / total as u64) as u32
    }

    pub fn exit_code(&self, intent: LockIntent) -> OpResult {
        lock(&self.inner.queue(intent).state).exit_code
    }

    pub fn wait(&self, intent: LockIntent) {
        let queue = self.inner.queue(intent);
        loop {
            let handle = lock(&queue.worker).take();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        warn!(?intent, "queue worker panicked");
                    }
                }
                None => return,
            }
        }
    }
}

fn finish_item(queue: &OpQueue, handler: &Arc<dyn OpHandler>, item: &QueuedItem, result: OpResult) {
    {
        let mut state = lock(&queue.state);
        state.current.retain(|current| current.hash != item.hash);
        state.done += 1;
        if !result.is_ok() && state.exit_code.is_ok() {
            state.exit_code = result;
        }
    }
    if result == OpResult::Abort {
        queue.abort.store(true, Ordering::Relaxed);
    }
    handler.on_result(item.hash, result);
}

fn run_worker(inner: Arc<ChannelInner>, intent: LockIntent) {
    let queue = inner.queue(intent);
    loop {
        let next = {
            let mut slot = lock(inner.lock_slot(intent));
            let mut state = lock(&queue.state);
            match state.pending.pop_front() {
                Some(item) => {
                    state.current.push(item.clone());
                    state.handler.clone().map(|handler| (item, handler))
                }
                None => {
                    if intent.uses_mod_lock() {
                        let mut library = lock(&inner.library);
                        let removed = library.ghost_bust();
                        inner.flush_deferred(&mut library);
                        debug!(?intent, removed, "queue drained");
                    }
                    *slot = None;
                    None
                }
            }
        };
        let Some((item, handler)) = next else {
            info!(?intent, "queue idle");
            return;
        };

        if queue.abort.load(Ordering::Relaxed) {
            finish_item(queue, &handler, &item, OpResult::Abort);
            continue;
        }
        handler.on_begin(item.hash);
        let result = match intent {
            LockIntent::Query => run_query(&inner, &item),
            _ => {
                let mut library = lock(&inner.library);
                let mut progress = |total: u64, current: u64| -> bool {
                    if queue.abort.load(Ordering::Relaxed) {
                        return false;
                    }
                    if !handler.on_progress(item.hash, current, total) {
                        queue.abort.store(true, Ordering::Relaxed);
                        return false;
                    }
                    true
                };
                match intent {
                    LockIntent::Supersede => library.supersede_mod(item.hash, &mut progress),
                    _ => {
                        let installed = library
                            .find_by_hash(item.hash)
                            .map(|pkg| pkg.is_installed());
                        match installed {
                            Some(true) => library.uninstall_mod(item.hash, &mut progress),
                            Some(false) => library.install_mod(item.hash, &mut progress),
                            None => OpResult::Abort,
                        }
                    }
                }
            }
        };
        finish_item(queue, &handler, &item, result);
    }
}

fn run_query(inner: &ChannelInner, item: &QueuedItem) -> OpResult {
    match inner.querier.query(&item.target) {
        Ok(repo) => {
            info!(url = %repo.url, packages = repo.packages.len(), "repository listed");
            lock(&inner.library).set_repo(repo);
            OpResult::Ok
        }
        Err(err) => {
            warn!(url = %item.target, "repository query failed: {}", crate::error::summarize(&err));
            crate::error::result_for(&err)
        }
    }
}

struct DownloadRelay {
    inner: Arc<ChannelInner>,
    handler: Arc<dyn OpHandler>,
}

impl DownloadRelay {
    fn item(&self, hash: u64) -> Option<QueuedItem> {
        lock(&self.inner.download.state)
            .current
            .iter()
            .find(|item| item.hash == hash)
            .cloned()
    }
}

impl DownloadEvents for DownloadRelay {
    fn on_progress(&self, hash: u64, received: u64, total: u64) -> bool {
        if let (Some(item), true) = (self.item(hash), total > 0) {
            let percent = (received.min(total) * 100 / total) as u32;
            item.progress.store(percent, Ordering::Relaxed);
        }
        if self.inner.download.abort.load(Ordering::Relaxed) {
            return false;
        }
        self.handler.on_progress(hash, received, total)
    }

    fn on_finished(&self, hash: u64, result: OpResult, path: Option<PathBuf>, error: String) {
        if !error.is_empty() {
            debug!(hash, "download finished with: {error}");
        }
        if let (OpResult::Ok, Some(path)) = (result, path) {
            self.inner.deliver_download(path);
        }
        let item = self.item(hash).unwrap_or_else(|| QueuedItem {
            hash,
            target: String::new(),
            progress: Arc::new(AtomicU32::new(0)),
        });
        item.progress.store(100, Ordering::Relaxed);
        let queue = &self.inner.download;
        finish_item(queue, &self.handler, &item, result);
        if queue.abort.load(Ordering::Relaxed) {
            let last = lock(&queue.state).current.last().map(|item| item.hash);
            if let Some(next) = last {
                self.inner.downloader.stop(next);
            }
        }
    }
}

/// Starts queued downloads up to the concurrency cap and exits once nothing
/// is pending or in flight.
fn run_download_starter(inner: Arc<ChannelInner>) {
    let queue = &inner.download;
    loop {
        let mut aborted = Vec::new();
        let started = {
            let mut slot = lock(&inner.net_lock);
            let mut state = lock(&queue.state);
            let Some(handler) = state.handler.clone() else {
                *slot = None;
                return;
            };
            if queue.abort.load(Ordering::Relaxed) {
                aborted.extend(state.pending.drain(..));
            }
            if state.pending.is_empty() && state.current.is_empty() && aborted.is_empty() {
                *slot = None;
                info!("download queue idle");
                return;
            }
            let max = lock(&inner.library).config().download_max.max(1);
            let next = if state.current.len() < max {
                state.pending.pop_front()
            } else {
                None
            };
            if let Some(item) = &next {
                state.current.push(item.clone());
            }
            (handler, next)
        };
        let (handler, next) = started;
        for item in &aborted {
            finish_item(queue, &handler, item, OpResult::Abort);
        }

        if let Some(item) = next {
            handler.on_begin(item.hash);
            let request = {
                let library = lock(&inner.library);
                let config = library.config();
                library.find_net_by_hash(item.hash).and_then(|pkg| {
                    let Some(dest) = download_dest(&config.library_dir, &pkg.file_name) else {
                        warn!(mod_ident = %pkg.identity, "download refused, {:?} leaves the library", pkg.file_name);
                        return None;
                    };
                    Some(DownloadRequest {
                        hash: pkg.hash,
                        url: pkg.url.clone(),
                        dest,
                        checksum: pkg.checksum.clone(),
                        rate_limit: config.per_download_rate(),
                    })
                })
            };
            let events: Arc<dyn DownloadEvents> = Arc::new(DownloadRelay {
                inner: Arc::clone(&inner),
                handler: Arc::clone(&handler),
            });
            match request {
                Some(request) => {
                    if let Err(err) = inner.downloader.start(request, events) {
                        warn!(hash = item.hash, "download not started: {}", crate::error::summarize(&err));
                        finish_item(queue, &handler, &item, OpResult::Error);
                    }
                }
                None => finish_item(queue, &handler, &item, OpResult::Abort),
            }
        }
        thread::sleep(DOWNLOAD_PACING);
    }
}
