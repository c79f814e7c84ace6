//! Render service - ties cache, queue and worker together behind one query

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use serde::Serialize;

use super::entity::Entity;
use super::lru::Cache;
use super::queue::{QueueOrder, RequestQueue};
use super::renderer::{PageRenderer, RenderError};
use super::types::{CacheEntry, Fingerprint, Lookup, Offset};
use super::worker::{RenderShared, WorkerState, process_job, render_worker};
use super::{DEFAULT_CACHE_SIZE, DEFAULT_SHUTDOWN_TIMEOUT};

/// Where render jobs run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// A dedicated background thread
    #[default]
    Threaded,
    /// No thread; the queue is drained on the consumer's thread from
    /// [`RenderService::poll_events`]. Meant for debugging.
    Inline,
}

/// Render service configuration
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub cache_capacity: usize,
    pub queue_order: QueueOrder,
    /// Minimum residency of cached bitmaps, see [`Cache::with_keep_time`]
    pub keep_time: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub mode: WorkerMode,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_SIZE,
            queue_order: QueueOrder::default(),
            keep_time: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            mode: WorkerMode::default(),
        }
    }
}

/// Handle returned by [`RenderService::on_entity_rendered`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Snapshot of service counters
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RenderStats {
    pub cache_len: usize,
    pub cache_capacity: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub rendered: u64,
    pub failed: u64,
    pub worker: WorkerState,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

type Listener = Box<dyn FnMut(&Entity)>;

/// Asynchronous render cache.
///
/// Owned by the consumer's (UI) thread. Queries never block on rendering;
/// completed renders are announced through [`RenderService::poll_events`].
pub struct RenderService {
    shared: Arc<RenderShared>,
    events_tx: Sender<Entity>,
    events_rx: Receiver<Entity>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
    worker: Option<WorkerHandle>,
    inline_renderer: Option<Box<dyn PageRenderer>>,
    shutdown_timeout: Duration,
}

impl RenderService {
    /// Start a render service.
    ///
    /// `make_renderer` runs on the thread that will render: the worker
    /// thread in [`WorkerMode::Threaded`], the calling thread in
    /// [`WorkerMode::Inline`]. A threaded renderer that fails to start
    /// leaves the service running with a stopped worker; every query then
    /// stays pending.
    pub fn new<F, R>(config: RenderConfig, make_renderer: F) -> Result<Self, RenderError>
    where
        F: FnOnce() -> Result<R, RenderError> + Send + 'static,
        R: PageRenderer + 'static,
    {
        let cache = match config.keep_time {
            Some(keep_time) => Cache::with_keep_time(config.cache_capacity, keep_time),
            None => Cache::new(config.cache_capacity),
        };
        let shared = Arc::new(RenderShared::new(
            cache,
            RequestQueue::new(config.queue_order),
        ));
        let (events_tx, events_rx) = flume::unbounded();

        let mut service = Self {
            shared,
            events_tx,
            events_rx,
            listeners: Vec::new(),
            next_listener_id: 1,
            worker: None,
            inline_renderer: None,
            shutdown_timeout: config.shutdown_timeout,
        };

        match config.mode {
            WorkerMode::Threaded => {
                let shared = Arc::clone(&service.shared);
                let events = service.events_tx.clone();
                let (exit_tx, exit_rx) = flume::bounded(1);
                let thread = std::thread::Builder::new()
                    .name("pdfcutter-render".to_string())
                    .spawn(move || render_worker(make_renderer, shared, events, exit_tx))
                    .map_err(|e| RenderError::generic(format!("cannot spawn render worker: {e}")))?;
                service.worker = Some(WorkerHandle {
                    thread,
                    exited: exit_rx,
                });
            }
            WorkerMode::Inline => {
                service.inline_renderer = Some(Box::new(make_renderer()?));
            }
        }

        debug!("Render service started ({:?})", config.mode);
        Ok(service)
    }

    /// Return a bitmap for `entity` at `scale` and `offset`, or queue a
    /// render and report it pending.
    ///
    /// A cached bitmap whose source no longer matches the entity is never
    /// returned. One that matches the source but was rendered at another
    /// scale or offset comes back as [`Lookup::Preview`] while the exact
    /// render is queued.
    pub fn get_rendered_or_queue(&self, entity: &Entity, scale: f64, offset: Offset) -> Lookup {
        let requested = Fingerprint::capture(entity, scale, offset);
        let cached = self.shared.cache().get(entity).cloned();

        match cached {
            None => {
                self.shared.queue.enqueue(entity, requested);
                Lookup::Pending
            }
            Some(entry) if !entry.fingerprint().source.same_as(&requested.source) => {
                self.shared.queue.enqueue(entity, requested);
                Lookup::Pending
            }
            Some(entry) if !entry.fingerprint().same_view(&requested) => {
                self.shared.queue.enqueue(entity, requested);
                Lookup::Preview(entry)
            }
            Some(entry) => Lookup::Exact(entry),
        }
    }

    /// Register a callback run from [`Self::poll_events`] for every
    /// entity whose render was published
    pub fn on_entity_rendered<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Entity) + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Deliver completed renders to listeners on the calling thread.
    ///
    /// In inline mode this first renders everything that is queued.
    pub fn poll_events(&mut self) -> Vec<Entity> {
        self.run_inline();
        let mut rendered = Vec::new();
        while let Ok(entity) = self.events_rx.try_recv() {
            self.dispatch(&entity);
            rendered.push(entity);
        }
        rendered
    }

    /// Like [`Self::poll_events`], but waits up to `timeout` for the first
    /// render to complete
    pub fn wait_events(&mut self, timeout: Duration) -> Vec<Entity> {
        if self.inline_renderer.is_some() {
            return self.poll_events();
        }

        let deadline = Instant::now() + timeout;
        let mut rendered = Vec::new();
        match self.events_rx.recv_deadline(deadline) {
            Ok(entity) => {
                self.dispatch(&entity);
                rendered.push(entity);
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return rendered,
        }
        rendered.extend(self.poll_events());
        rendered
    }

    /// Raw completion channel for consumers that run their own event loop.
    ///
    /// Entities taken from here bypass registered listeners.
    #[must_use]
    pub fn event_receiver(&self) -> &Receiver<Entity> {
        &self.events_rx
    }

    /// Cached entry for `entity` without promoting it or queueing anything
    #[must_use]
    pub fn peek_cached(&self, entity: &Entity) -> Option<Arc<CacheEntry>> {
        self.shared.cache().peek(entity).cloned()
    }

    /// Whether a render of `entity` is queued or running
    #[must_use]
    pub fn is_pending(&self, entity: &Entity) -> bool {
        self.shared.queue.is_queued(entity) || self.shared.queue.is_in_flight(entity)
    }

    /// Forget the cached bitmap of one entity
    pub fn invalidate(&self, entity: &Entity) -> bool {
        self.shared.cache().delete(entity).is_some()
    }

    /// Forget every cached bitmap, e.g. after the document changed on disk
    pub fn invalidate_all(&self) {
        self.shared.cache().clear();
    }

    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.shared.state()
    }

    #[must_use]
    pub fn stats(&self) -> RenderStats {
        let (cache_len, cache_capacity, cache_hits, cache_misses) = {
            let cache = self.shared.cache();
            (cache.len(), cache.capacity(), cache.hits(), cache.misses())
        };
        RenderStats {
            cache_len,
            cache_capacity,
            cache_hits,
            cache_misses,
            queued: self.shared.queue.len(),
            in_flight: self.shared.queue.in_flight_len(),
            rendered: self.shared.rendered(),
            failed: self.shared.failed(),
            worker: self.shared.state(),
        }
    }

    /// Stop the worker.
    ///
    /// New requests are refused at once. A render already in progress is
    /// abandoned: this waits at most the configured shutdown timeout and
    /// then detaches the worker thread.
    pub fn shutdown(&mut self) {
        self.shared.queue.close();
        self.inline_renderer = None;

        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.exited.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Render worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Render worker still busy after {:?}, detaching it",
                    self.shutdown_timeout
                );
            }
        }
    }

    fn run_inline(&mut self) {
        let Some(renderer) = self.inline_renderer.as_mut() else {
            return;
        };
        while let Some(job) = self.shared.queue.dequeue() {
            process_job(renderer.as_mut(), &self.shared, &self.events_tx, job);
            self.shared.set_state(WorkerState::Idle);
        }
    }

    fn dispatch(&mut self, entity: &Entity) {
        for (_, listener) in &mut self.listeners {
            listener(entity);
        }
    }
}

impl Drop for RenderService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
