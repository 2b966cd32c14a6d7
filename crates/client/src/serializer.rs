//! Work serializer: runs events one at a time without recursion.
//!
//! Every producer pushes its event into the queue. The producer that finds
//! the serializer idle becomes the drainer and processes events, including
//! ones pushed by handlers while it runs, until the queue is empty. Other
//! producers return immediately. Handlers therefore never re-enter one
//! another, and no lock is held while a handler runs.

use std::{collections::VecDeque, fmt};

use parking_lot::Mutex;

struct Queue<E> {
    events: VecDeque<E>,
    draining: bool,
}

/// A FIFO event queue with a single active drainer.
pub struct Serializer<E> {
    queue: Mutex<Queue<E>>,
}

impl<E> Serializer<E> {
    /// Creates an idle serializer.
    #[must_use]
    pub fn new() -> Self {
        Self { queue: Mutex::new(Queue { events: VecDeque::new(), draining: false }) }
    }

    /// Enqueues `event`.
    ///
    /// Returns true when the caller has become the drainer and must call
    /// [`Serializer::next`] until it returns `None`.
    pub fn push(&self, event: E) -> bool {
        let mut queue = self.queue.lock();
        queue.events.push_back(event);
        if queue.draining {
            false
        } else {
            queue.draining = true;
            true
        }
    }

    /// Takes the next event. Returning `None` releases the drainer role.
    pub fn next(&self) -> Option<E> {
        let mut queue = self.queue.lock();
        let event = queue.events.pop_front();
        if event.is_none() {
            queue.draining = false;
        }
        event
    }

    /// Enqueues `event` and, if this caller became the drainer, runs
    /// `handler` on every queued event.
    pub fn run(&self, event: E, mut handler: impl FnMut(E)) {
        if self.push(event) {
            while let Some(event) = self.next() {
                handler(event);
            }
        }
    }

    /// Number of events waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Returns true when no events are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Serializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Serializer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("Serializer")
            .field("pending", &queue.events.len())
            .field("draining", &queue.draining)
            .finish()
    }
}
