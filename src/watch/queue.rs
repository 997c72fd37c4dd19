//! Unbounded FIFO between one watcher and its worker pool.

use async_channel::{Receiver, Sender};

/// Kind of change observed on a watched object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed change, consumed by exactly one worker.
///
/// Events are not redelivered: one dequeued by a worker that then dies is lost.
#[derive(Clone, Debug)]
pub struct QueueEvent<K> {
    pub event_type: EventType,
    pub object: K,
}

impl<K> QueueEvent<K> {
    pub fn new(event_type: EventType, object: K) -> Self {
        Self { event_type, object }
    }
}

pub type EventSender<K> = Sender<QueueEvent<K>>;
pub type EventReceiver<K> = Receiver<QueueEvent<K>>;

/// Create the shared queue. Receivers are cloned per worker.
pub fn event_queue<K>() -> (EventSender<K>, EventReceiver<K>) {
    async_channel::unbounded()
}
