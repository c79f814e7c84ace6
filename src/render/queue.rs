//! Deduplicating render request queue
//!
//! Holds at most one queued job per entity. Re-requesting a queued entity
//! overwrites its parameters in place. Jobs move to an in-flight set when
//! dequeued and leave it when the worker calls [`RequestQueue::finish`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::types::{Fingerprint, PendingJob};

/// Order in which queued entities are handed to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Most recently added entity first; it is the most likely to still be
    /// on screen
    #[default]
    Lifo,
    /// Oldest entity first
    Fifo,
}

/// Result of [`RequestQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was appended
    Added,
    /// A queued job for the entity had its fingerprint overwritten
    Updated,
    /// The entity is already rendering with the same fingerprint
    InFlight,
    /// The queue is closed and accepts no more work
    Closed,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<Entity>,
    queued: HashMap<Entity, Fingerprint>,
    in_flight: HashMap<Entity, Fingerprint>,
    closed: bool,
}

/// Outstanding render work, shared by the query path and the worker
pub struct RequestQueue {
    state: Mutex<QueueState>,
    order: QueueOrder,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl RequestQueue {
    #[must_use]
    pub fn new(order: QueueOrder) -> Self {
        // One slot is enough: a pending ring already guarantees the worker
        // rescans the queue.
        let (doorbell_tx, doorbell_rx) = flume::bounded(1);
        Self {
            state: Mutex::new(QueueState::default()),
            order,
            doorbell_tx,
            doorbell_rx,
        }
    }

    #[must_use]
    pub fn order(&self) -> QueueOrder {
        self.order
    }

    /// Request a render of `entity`, waking the worker if it is idle
    pub fn enqueue(&self, entity: &Entity, fingerprint: Fingerprint) -> Enqueued {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                Enqueued::Closed
            } else if state
                .in_flight
                .get(entity)
                .is_some_and(|current| current.matches(&fingerprint))
            {
                // A queued follow-up would only repeat the running render
                Self::drop_queued(&mut state, entity);
                Enqueued::InFlight
            } else if let Some(queued) = state.queued.get_mut(entity) {
                *queued = fingerprint;
                Enqueued::Updated
            } else {
                state.queued.insert(entity.clone(), fingerprint);
                state.order.push_back(entity.clone());
                Enqueued::Added
            }
        };

        if matches!(outcome, Enqueued::Added | Enqueued::Updated) {
            debug!("Queued render of {entity} at scale {}", fingerprint.scale);
            self.ring();
        }
        outcome
    }

    /// Take the next job without blocking
    pub fn dequeue(&self) -> Option<PendingJob> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        Self::take(&mut state, self.order)
    }

    /// Block until a job is available; `None` once the queue is closed
    pub fn wait_dequeue(&self) -> Option<PendingJob> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(job) = Self::take(&mut state, self.order) {
                    return Some(job);
                }
            }
            // We own a sender, so the doorbell never disconnects
            if self.doorbell_rx.recv().is_err() {
                return None;
            }
        }
    }

    /// Record the fingerprint the worker is about to render for `entity`.
    ///
    /// The worker re-reads live geometry after dequeueing, so this may differ
    /// from the fingerprint the job was queued with. A queued follow-up that
    /// matches it is dropped.
    ///
    /// # Panics
    ///
    /// If `entity` is not in flight.
    pub fn start(&self, entity: &Entity, rendering: Fingerprint) {
        let mut state = self.lock();
        let Some(current) = state.in_flight.get_mut(entity) else {
            drop(state);
            panic!("render job for {entity} started but was never dequeued");
        };
        *current = rendering;
        if state
            .queued
            .get(entity)
            .is_some_and(|queued| queued.matches(&rendering))
        {
            Self::drop_queued(&mut state, entity);
        }
    }

    /// Mark the in-flight job for `entity` as delivered.
    ///
    /// # Panics
    ///
    /// If `entity` was never dequeued; that means two parties are finishing
    /// the same job and the queue bookkeeping can no longer be trusted.
    pub fn finish(&self, entity: &Entity) {
        let mut state = self.lock();
        if state.in_flight.remove(entity).is_none() {
            drop(state);
            panic!("render job for {entity} finished but was never dequeued");
        }
    }

    /// Drop a queued (not yet started) job
    pub fn remove(&self, entity: &Entity) -> bool {
        Self::drop_queued(&mut self.lock(), entity)
    }

    /// Stop accepting work and release a blocked worker
    pub fn close(&self) {
        self.lock().closed = true;
        self.ring();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued jobs, excluding in-flight ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queued.is_empty()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    #[must_use]
    pub fn is_queued(&self, entity: &Entity) -> bool {
        self.lock().queued.contains_key(entity)
    }

    #[must_use]
    pub fn is_in_flight(&self, entity: &Entity) -> bool {
        self.lock().in_flight.contains_key(entity)
    }

    /// Fingerprint currently queued for `entity`
    #[cfg(test)]
    fn queued_fingerprint(&self, entity: &Entity) -> Option<Fingerprint> {
        self.lock().queued.get(entity).copied()
    }

    fn take(state: &mut QueueState, order: QueueOrder) -> Option<PendingJob> {
        // Skip entities another worker is still rendering so one entity is
        // never rendered twice at once.
        let position = match order {
            QueueOrder::Lifo => state
                .order
                .iter()
                .rposition(|entity| !state.in_flight.contains_key(entity)),
            QueueOrder::Fifo => state
                .order
                .iter()
                .position(|entity| !state.in_flight.contains_key(entity)),
        }?;

        let entity = state.order.remove(position)?;
        let Some(fingerprint) = state.queued.remove(&entity) else {
            panic!("queue order lists {entity} but no job is queued for it");
        };
        state.in_flight.insert(entity.clone(), fingerprint);
        Some(PendingJob {
            entity,
            fingerprint,
        })
    }

    fn drop_queued(state: &mut QueueState, entity: &Entity) -> bool {
        if state.queued.remove(entity).is_some() {
            state.order.retain(|queued| queued != entity);
            true
        } else {
            false
        }
    }

    fn ring(&self) {
        // A full doorbell already has a wake-up pending
        let _ = self.doorbell_tx.try_send(());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::render::entity::{BoxGeometry, BoxHandle, SourceRect};
    use crate::render::types::Offset;

    fn fp(entity: &Entity, scale: f64) -> Fingerprint {
        Fingerprint::capture(entity, scale, Offset::default())
    }

    #[test]
    fn requeue_overwrites_parameters() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let entity = Entity::from(BoxHandle::new(BoxGeometry::default()));

        assert_eq!(queue.enqueue(&entity, fp(&entity, 1.0)), Enqueued::Added);
        assert_eq!(queue.enqueue(&entity, fp(&entity, 2.0)), Enqueued::Updated);
        assert_eq!(queue.len(), 1);

        let job = queue.dequeue().unwrap();
        assert_eq!(job.entity, entity);
        assert_eq!(job.fingerprint.scale, 2.0);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn lifo_and_fifo_orders() {
        let lifo = RequestQueue::new(QueueOrder::Lifo);
        let fifo = RequestQueue::new(QueueOrder::Fifo);
        for page in 0..3 {
            let entity = Entity::page(page);
            lifo.enqueue(&entity, fp(&entity, 1.0));
            fifo.enqueue(&entity, fp(&entity, 1.0));
        }

        let lifo_pages: Vec<_> = std::iter::from_fn(|| lifo.dequeue())
            .map(|job| job.entity)
            .collect();
        let fifo_pages: Vec<_> = std::iter::from_fn(|| fifo.dequeue())
            .map(|job| job.entity)
            .collect();

        assert_eq!(
            lifo_pages,
            vec![Entity::page(2), Entity::page(1), Entity::page(0)]
        );
        assert_eq!(
            fifo_pages,
            vec![Entity::page(0), Entity::page(1), Entity::page(2)]
        );
    }

    #[test]
    fn overwrite_keeps_position() {
        let queue = RequestQueue::new(QueueOrder::Fifo);
        let (a, b) = (Entity::page(0), Entity::page(1));
        queue.enqueue(&a, fp(&a, 1.0));
        queue.enqueue(&b, fp(&b, 1.0));
        queue.enqueue(&a, fp(&a, 3.0));

        let first = queue.dequeue().unwrap();
        assert_eq!(first.entity, a);
        assert_eq!(first.fingerprint.scale, 3.0);
    }

    #[test]
    fn in_flight_entity_with_same_request_is_not_queued_again() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let page = Entity::page(0);
        queue.enqueue(&page, fp(&page, 1.0));
        let job = queue.dequeue().unwrap();

        assert_eq!(queue.enqueue(&page, fp(&page, 1.0)), Enqueued::InFlight);
        assert!(queue.is_empty());

        // A different request while rendering becomes a follow-up job
        assert_eq!(queue.enqueue(&page, fp(&page, 2.0)), Enqueued::Added);
        assert!(queue.dequeue().is_none(), "entity is still in flight");

        queue.finish(&job.entity);
        let follow_up = queue.dequeue().unwrap();
        assert_eq!(follow_up.fingerprint.scale, 2.0);
    }

    #[test]
    fn returning_to_the_running_request_drops_the_follow_up() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let page = Entity::page(0);
        queue.enqueue(&page, fp(&page, 1.0));
        let job = queue.dequeue().unwrap();

        assert_eq!(queue.enqueue(&page, fp(&page, 2.0)), Enqueued::Added);
        assert_eq!(queue.enqueue(&page, fp(&page, 1.0)), Enqueued::InFlight);
        assert!(queue.is_empty());
        assert!(queue.queued_fingerprint(&page).is_none());

        queue.finish(&job.entity);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn start_records_what_is_actually_rendered() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let handle = BoxHandle::new(BoxGeometry::new(0, SourceRect::new(0.0, 0.0, 10.0, 10.0)));
        let entity = Entity::from(handle.clone());
        queue.enqueue(&entity, fp(&entity, 1.0));

        // Moved between queueing and dequeueing
        handle.set_source(0, SourceRect::new(5.0, 0.0, 10.0, 10.0));
        let job = queue.dequeue().unwrap();
        let live = fp(&entity, job.fingerprint.scale);
        assert!(!live.matches(&job.fingerprint));
        queue.start(&entity, live);

        assert_eq!(queue.enqueue(&entity, fp(&entity, 1.0)), Enqueued::InFlight);
        assert!(queue.is_empty());
    }

    #[test]
    fn start_drops_follow_up_matching_the_live_render() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let handle = BoxHandle::new(BoxGeometry::new(0, SourceRect::new(0.0, 0.0, 10.0, 10.0)));
        let entity = Entity::from(handle.clone());
        queue.enqueue(&entity, fp(&entity, 1.0));
        let job = queue.dequeue().unwrap();

        handle.set_source(1, SourceRect::new(0.0, 0.0, 20.0, 20.0));
        assert_eq!(queue.enqueue(&entity, fp(&entity, 1.0)), Enqueued::Added);
        assert_eq!(
            queue.queued_fingerprint(&entity).map(|f| f.source),
            Some(entity.source())
        );

        queue.start(&job.entity, fp(&entity, 1.0));
        assert!(queue.queued_fingerprint(&entity).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "never dequeued")]
    fn starting_a_job_that_was_not_dequeued_is_fatal() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let page = Entity::page(0);
        queue.start(&page, fp(&page, 1.0));
    }

    #[test]
    #[should_panic(expected = "never dequeued")]
    fn finishing_twice_is_fatal() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let page = Entity::page(0);
        queue.enqueue(&page, fp(&page, 1.0));
        let job = queue.dequeue().unwrap();
        queue.finish(&job.entity);
        queue.finish(&job.entity);
    }

    #[test]
    fn remove_drops_only_queued_jobs() {
        let queue = RequestQueue::new(QueueOrder::Lifo);
        let (a, b) = (Entity::page(0), Entity::page(1));
        queue.enqueue(&a, fp(&a, 1.0));
        queue.enqueue(&b, fp(&b, 1.0));
        let in_flight = queue.dequeue().unwrap();

        assert!(!queue.remove(&in_flight.entity));
        assert!(queue.remove(&a));
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[test]
    fn closed_queue_rejects_work_and_releases_waiter() {
        let queue = Arc::new(RequestQueue::new(QueueOrder::Lifo));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert!(waiter.join().unwrap().is_none());
        let page = Entity::page(0);
        assert_eq!(queue.enqueue(&page, fp(&page, 1.0)), Enqueued::Closed);
    }

    #[test]
    fn waiter_wakes_on_enqueue() {
        let queue = Arc::new(RequestQueue::new(QueueOrder::Lifo));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_dequeue())
        };
        thread::sleep(Duration::from_millis(20));
        let page = Entity::page(7);
        queue.enqueue(&page, fp(&page, 1.0));

        let job = waiter.join().unwrap().unwrap();
        assert_eq!(job.entity, page);
    }

    #[test]
    fn concurrent_producers_lose_and_duplicate_nothing() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 50;

        let queue = Arc::new(RequestQueue::new(QueueOrder::Fifo));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let entity = Entity::page(p * PER_PRODUCER + i);
                        queue.enqueue(&entity, fp(&entity, 1.0));
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < PRODUCERS * PER_PRODUCER {
                    if let Some(job) = queue.wait_dequeue() {
                        queue.finish(&job.entity);
                        seen.push(job.entity);
                    }
                }
                seen
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        seen.sort_by_key(|entity| match entity {
            Entity::Page(page) => page.0,
            Entity::Box(_) => usize::MAX,
        });
        seen.dedup();

        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight_len(), 0);
    }
}
