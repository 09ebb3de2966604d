//! Fan-out of events to observers with bounded, lossy per-observer queues.
//!
//! Publishing never blocks and never waits for an observer. Each observer owns
//! a mailbox of at most `capacity` events; when it falls behind, older
//! progress for a job is superseded by newer progress for the same job, and a
//! full mailbox sheds its least valuable event. Observers that have gone away
//! are dropped the next time a publish tries to reach them.

use encodeforge_common::ObserverId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{Event, EventPayload};

/// Per-observer mailbox capacity when none is configured.
const DEFAULT_CAPACITY: usize = 64;

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn deliver(&self, event: Event, capacity: usize) {
        let mut queue = self.queue.lock();

        if event.payload.is_progress() {
            let job_id = event.payload.job_id();
            if let Some(pos) = queue
                .iter()
                .position(|e| e.payload.is_progress() && e.payload.job_id() == job_id)
            {
                queue.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        while queue.len() >= capacity.max(1) {
            let victim = queue
                .iter()
                .position(|e| e.payload.is_progress())
                .or_else(|| {
                    queue
                        .iter()
                        .position(|e| matches!(e.payload, EventPayload::QueueUpdate))
                })
                .unwrap_or(0);
            queue.remove(victim);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

struct HubInner {
    observers: Mutex<HashMap<ObserverId, Arc<Mailbox>>>,
    capacity: usize,
}

/// Broadcast hub shared by the scheduler and every observer.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Create a hub whose observers each buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                observers: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a new observer. It receives events published from now on.
    pub fn register(&self) -> Subscription {
        let id = ObserverId::new();
        let mailbox = Arc::new(Mailbox::new(self.inner.capacity));
        self.inner.observers.lock().insert(id, mailbox.clone());
        tracing::debug!(observer_id = %id, "Observer registered");
        Subscription { id, mailbox }
    }

    /// Remove an observer. Its subscription yields what is already queued and
    /// then ends.
    pub fn unregister(&self, id: ObserverId) -> bool {
        match self.inner.observers.lock().remove(&id) {
            Some(mailbox) => {
                mailbox.close();
                tracing::debug!(observer_id = %id, "Observer unregistered");
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every live observer. Returns the event and the
    /// number of observers it reached.
    pub fn publish(&self, payload: EventPayload) -> (Event, usize) {
        let event = Event::new(payload);
        let mut observers = self.inner.observers.lock();

        let mut gone = Vec::new();
        let mut delivered = 0;
        for (id, mailbox) in observers.iter() {
            if mailbox.is_closed() {
                gone.push(*id);
                continue;
            }
            mailbox.deliver(event.clone(), self.inner.capacity);
            delivered += 1;
        }
        for id in gone {
            observers.remove(&id);
            tracing::debug!(observer_id = %id, "Dropped disconnected observer");
        }
        drop(observers);

        if delivered == 0 {
            tracing::trace!("No observers for event");
        }
        (event, delivered)
    }

    /// Number of registered observers, including disconnected ones not yet
    /// pruned by a publish.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// End every subscription. Used on shutdown.
    pub fn close(&self) {
        for (_, mailbox) in self.inner.observers.lock().drain() {
            mailbox.close();
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One observer's receiving end. Dropping it disconnects the observer.
pub struct Subscription {
    id: ObserverId,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the hub has closed this
    /// subscription and its mailbox is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.mailbox.queue.lock().pop_front()
    }

    /// Events this observer lost to superseding or overflow.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.closed.store(true, Ordering::Release);
    }
}
