use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use relayt_model::UserId;

/// What happened, for the operator's eyes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOp {
    Broadcast,
    QueueEnqueue,
    QueueDrain,
    RetryAttempt,
    RetryExhausted,
    ModeChange,
    FallbackPush,
}

/// One structured entry in the observability ring.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub operation: TelemetryOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TelemetryEvent {
    pub fn now(operation: TelemetryOp) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            user_id: None,
            event_id: None,
            queue_size: None,
            retry_count: None,
            error: None,
            detail: None,
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn retries(mut self, count: i32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fixed-capacity circular buffer of recent queue and broadcast events.
///
/// Append is O(1) against preallocated slots; overflow silently overwrites
/// the oldest entry. Purely process-local.
#[derive(Debug)]
pub struct TelemetryRing {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<TelemetryEvent>>,
    head: usize,
    len: usize,
}

impl TelemetryRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "telemetry ring capacity must be non-zero");
        Self {
            inner: Mutex::new(Ring {
                slots: vec![None; capacity],
                head: 0,
                len: 0,
            }),
        }
    }

    pub fn record(&self, event: TelemetryEvent) {
        let mut ring = self.inner.lock().expect("telemetry ring poisoned");
        let capacity = ring.slots.len();
        let head = ring.head;
        ring.slots[head] = Some(event);
        ring.head = (head + 1) % capacity;
        ring.len = (ring.len + 1).min(capacity);
    }

    /// Up to `n` most recent events, newest first.
    pub fn recent(&self, n: usize) -> Vec<TelemetryEvent> {
        let ring = self.inner.lock().expect("telemetry ring poisoned");
        let capacity = ring.slots.len();
        let take = n.min(ring.len);
        let mut out = Vec::with_capacity(take);
        for offset in 1..=take {
            let index = (ring.head + capacity - offset) % capacity;
            if let Some(event) = &ring.slots[index] {
                out.push(event.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("telemetry ring poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(detail: &str) -> TelemetryEvent {
        TelemetryEvent::now(TelemetryOp::Broadcast).detail(detail)
    }

    #[test]
    fn reads_come_back_newest_first() {
        let ring = TelemetryRing::new(8);
        ring.record(entry("a"));
        ring.record(entry("b"));
        ring.record(entry("c"));

        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].detail.as_deref(), Some("c"));
        assert_eq!(recent[1].detail.as_deref(), Some("b"));
    }

    #[test]
    fn overflow_overwrites_oldest() {
        let ring = TelemetryRing::new(3);
        for i in 0..5 {
            ring.record(entry(&i.to_string()));
        }
        assert_eq!(ring.len(), 3);

        let recent = ring.recent(10);
        let details: Vec<_> = recent
            .iter()
            .map(|e| e.detail.as_deref().unwrap())
            .collect();
        assert_eq!(details, ["4", "3", "2"]);
    }

    #[test]
    fn empty_ring_reads_nothing() {
        let ring = TelemetryRing::new(4);
        assert!(ring.is_empty());
        assert!(ring.recent(10).is_empty());
    }
}
