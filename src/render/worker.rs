//! Render worker - drains the request queue on a dedicated thread

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::Sender;
use log::{debug, error, warn};
use serde::Serialize;

use super::entity::Entity;
use super::lru::{Cache, Insertion};
use super::queue::RequestQueue;
use super::renderer::{PageRenderer, RenderError, RenderTarget};
use super::types::{CacheEntry, Fingerprint, PendingJob};

/// Lifecycle of the render worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting for work
    Idle = 0,
    /// Inside the rendering collaborator
    Rendering = 1,
    /// Storing a finished bitmap and notifying the consumer
    Publishing = 2,
    /// Exited; no further jobs will run
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Rendering,
            2 => Self::Publishing,
            _ => Self::Stopped,
        }
    }
}

pub(crate) type EntryCache = Cache<Entity, Arc<CacheEntry>>;

/// State shared between the facade and the worker.
///
/// The cache and the queue each have their own lock; neither is held while
/// the renderer runs.
pub(crate) struct RenderShared {
    cache: Mutex<EntryCache>,
    pub(crate) queue: RequestQueue,
    state: AtomicU8,
    rendered: AtomicU64,
    failed: AtomicU64,
}

impl RenderShared {
    pub(crate) fn new(cache: EntryCache, queue: RequestQueue) -> Self {
        Self {
            cache: Mutex::new(cache),
            queue,
            state: AtomicU8::new(WorkerState::Idle as u8),
            rendered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, EntryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Main worker function - runs in a dedicated thread.
///
/// The renderer is built here so thread-bound document handles never cross
/// threads. `exited` is signalled on the way out so shutdown can wait with
/// a timeout.
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub(crate) fn render_worker<F, R>(
    make_renderer: F,
    shared: Arc<RenderShared>,
    events: Sender<Entity>,
    exited: Sender<()>,
) where
    F: FnOnce() -> Result<R, RenderError>,
    R: PageRenderer,
{
    let mut renderer = match make_renderer() {
        Ok(renderer) => renderer,
        Err(e) => {
            error!("Render worker could not open the document: {e}");
            shared.queue.close();
            shared.set_state(WorkerState::Stopped);
            let _ = exited.send(());
            return;
        }
    };

    debug!(
        "Render worker started ({} pages)",
        renderer.page_count()
    );
    shared.set_state(WorkerState::Idle);

    while let Some(job) = shared.queue.wait_dequeue() {
        process_job(&mut renderer, &shared, &events, job);
        shared.set_state(WorkerState::Idle);
    }

    shared.set_state(WorkerState::Stopped);
    debug!("Render worker stopped");
    let _ = exited.send(());
}

/// Render one dequeued job and publish the result.
///
/// The entity's geometry is read again here, so a box moved after it was
/// queued is rendered where it is now. Failures are logged and dropped.
pub(crate) fn process_job<R>(
    renderer: &mut R,
    shared: &RenderShared,
    events: &Sender<Entity>,
    job: PendingJob,
) where
    R: PageRenderer + ?Sized,
{
    let PendingJob {
        entity,
        fingerprint: requested,
    } = job;

    shared.set_state(WorkerState::Rendering);
    let live = Fingerprint::capture(&entity, requested.scale, requested.offset);
    shared.queue.start(&entity, live);
    let target = RenderTarget::new(&live, entity.pixel_format());
    let result = renderer.render(&target);

    match result {
        Ok(bitmap) => {
            shared.set_state(WorkerState::Publishing);
            let entry = Arc::new(CacheEntry::new(bitmap, live));
            let insertion = shared.cache().set(entity.clone(), entry);
            let stored = match insertion {
                Insertion::Evicted(victim, _) => {
                    debug!("Evicted {victim} to cache {entity}");
                    true
                }
                Insertion::Rejected(..) => {
                    debug!("Cache is pinned by young entries, dropped render of {entity}");
                    false
                }
                Insertion::Inserted | Insertion::Replaced(_) => true,
            };
            shared.queue.finish(&entity);
            shared.rendered.fetch_add(1, Ordering::Relaxed);
            if stored {
                // The consumer may be gone already; nothing left to notify then
                let _ = events.send(entity);
            }
        }
        Err(e) => {
            shared.queue.finish(&entity);
            shared.failed.fetch_add(1, Ordering::Relaxed);
            if e.is_transient() {
                warn!("Skipping render of {entity} at scale {}: {e}", live.scale);
            } else {
                error!("Render of {entity} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::entity::{BoxGeometry, BoxHandle, SourceRect};
    use crate::render::queue::QueueOrder;
    use crate::render::types::{Bitmap, Offset, PixelFormat};

    /// Renders 1x1 bitmaps and records every target it was asked for
    struct Recorder {
        targets: Vec<RenderTarget>,
        fail_with_oom: bool,
    }

    impl PageRenderer for Recorder {
        fn page_count(&self) -> usize {
            10
        }

        fn render(&mut self, target: &RenderTarget) -> Result<Bitmap, RenderError> {
            self.targets.push(*target);
            if self.fail_with_oom {
                return Err(RenderError::OutOfMemory {
                    width: 1,
                    height: 1,
                });
            }
            Bitmap::blank(target.format, 1, 1)
        }
    }

    fn shared() -> RenderShared {
        RenderShared::new(Cache::new(4), RequestQueue::new(QueueOrder::Lifo))
    }

    #[test]
    fn job_renders_current_geometry_and_notifies() {
        let shared = shared();
        let (tx, rx) = flume::unbounded();
        let handle = BoxHandle::new(BoxGeometry::new(0, SourceRect::new(0.0, 0.0, 10.0, 10.0)));
        let entity = Entity::from(handle.clone());

        shared.queue.enqueue(
            &entity,
            Fingerprint::capture(&entity, 2.0, Offset::default()),
        );
        // Moved after queueing: the worker must render the new position
        handle.set_source(1, SourceRect::new(5.0, 5.0, 10.0, 10.0));

        let mut renderer = Recorder {
            targets: Vec::new(),
            fail_with_oom: false,
        };
        let job = shared.queue.dequeue().unwrap();
        process_job(&mut renderer, &shared, &tx, job);

        assert_eq!(renderer.targets.len(), 1);
        assert_eq!(renderer.targets[0].page, 1);
        assert_eq!(renderer.targets[0].format, PixelFormat::Rgba);
        assert_eq!(rx.try_recv().unwrap(), entity);

        let cache = shared.cache();
        let entry = cache.peek(&entity).unwrap();
        assert!(entry.fingerprint().source.same_as(&entity.source()));
        assert_eq!(shared.queue.in_flight_len(), 0);
        assert_eq!(shared.rendered(), 1);
        assert_eq!(shared.state(), WorkerState::Publishing);
    }

    #[test]
    fn failed_job_leaves_cache_untouched() {
        let shared = shared();
        let (tx, rx) = flume::unbounded();
        let page = Entity::page(0);
        shared
            .queue
            .enqueue(&page, Fingerprint::capture(&page, 50.0, Offset::default()));

        let mut renderer = Recorder {
            targets: Vec::new(),
            fail_with_oom: true,
        };
        let job = shared.queue.dequeue().unwrap();
        process_job(&mut renderer, &shared, &tx, job);

        assert!(rx.try_recv().is_err());
        assert!(shared.cache().is_empty());
        assert_eq!(shared.failed(), 1);
        assert_eq!(shared.queue.in_flight_len(), 0);
    }

    #[test]
    fn worker_exits_when_renderer_cannot_start() {
        let shared = Arc::new(shared());
        let (tx, _rx) = flume::unbounded();
        let (exit_tx, exit_rx) = flume::bounded(1);

        render_worker(
            || -> Result<Recorder, RenderError> { Err(RenderError::generic("no document")) },
            Arc::clone(&shared),
            tx,
            exit_tx,
        );

        assert!(exit_rx.try_recv().is_ok());
        assert_eq!(shared.state(), WorkerState::Stopped);
        assert!(shared.queue.is_closed());
    }
}
