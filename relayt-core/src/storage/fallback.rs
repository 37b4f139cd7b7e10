use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use tracing::warn;

use relayt_model::{QueuedEvent, UserId};

/// Per-user bounded ring buffers for queue writes the primary store refused.
///
/// In-process and lossy across restarts: availability of the hot path wins
/// over durability here. After the next successful persisted write for a
/// user, the caller drains that user's buffer back into primary storage.
#[derive(Debug)]
pub struct FallbackBuffers {
    capacity: usize,
    buffers: RwLock<HashMap<UserId, Mutex<VecDeque<QueuedEvent>>>>,
}

impl FallbackBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Park an event that could not be persisted. Oldest entries fall off
    /// when the ring is full.
    pub fn push(&self, event: QueuedEvent) {
        let user_id = event.user_id;
        {
            let buffers = self.buffers.read().expect("fallback map poisoned");
            if let Some(buffer) = buffers.get(&user_id) {
                Self::push_bounded(
                    &mut buffer.lock().expect("fallback ring poisoned"),
                    event,
                    self.capacity,
                    user_id,
                );
                return;
            }
        }

        let mut buffers =
            self.buffers.write().expect("fallback map poisoned");
        let buffer = buffers
            .entry(user_id)
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        Self::push_bounded(
            &mut buffer.lock().expect("fallback ring poisoned"),
            event,
            self.capacity,
            user_id,
        );
    }

    fn push_bounded(
        ring: &mut VecDeque<QueuedEvent>,
        event: QueuedEvent,
        capacity: usize,
        user_id: UserId,
    ) {
        if ring.len() >= capacity {
            ring.pop_front();
            warn!(%user_id, "Fallback buffer full, dropping oldest event");
        }
        ring.push_back(event);
    }

    /// Take every buffered event for one user, oldest first, emptying the
    /// ring.
    pub fn drain(&self, user_id: UserId) -> Vec<QueuedEvent> {
        let buffers = self.buffers.read().expect("fallback map poisoned");
        match buffers.get(&user_id) {
            Some(buffer) => buffer
                .lock()
                .expect("fallback ring poisoned")
                .drain(..)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, user_id: UserId) -> usize {
        let buffers = self.buffers.read().expect("fallback map poisoned");
        buffers
            .get(&user_id)
            .map(|buffer| buffer.lock().expect("fallback ring poisoned").len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id) == 0
    }
}
