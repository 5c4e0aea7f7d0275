//! Bounded indexed event ring.
//!
//! One append-only, session-scoped ring per session: an in-memory buffer
//! with a capacity bound and a drop counter, supporting `since(i)` slicing
//! and aggregate `stats` that a plain unbounded log would not give for
//! free.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One event kind `IndexedEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Tool,
    Error,
    Completion,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexedEvent {
    pub index: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl IndexedEvent {
    pub fn message(role: impl Into<String>, text: impl Into<String>) -> NewEvent {
        NewEvent {
            kind: EventKind::Message,
            role: Some(role.into()),
            tool_name: None,
            text: Some(text.into()),
        }
    }

    pub fn tool(name: impl Into<String>) -> NewEvent {
        NewEvent {
            kind: EventKind::Tool,
            role: None,
            tool_name: Some(name.into()),
            text: None,
        }
    }

    pub fn error(text: impl Into<String>) -> NewEvent {
        NewEvent {
            kind: EventKind::Error,
            role: None,
            tool_name: None,
            text: Some(text.into()),
        }
    }

    pub fn completion(final_text: impl Into<String>) -> NewEvent {
        NewEvent {
            kind: EventKind::Completion,
            role: None,
            tool_name: None,
            text: Some(final_text.into()),
        }
    }
}

/// An event not yet assigned an index — the payload `append` accepts.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub role: Option<String>,
    pub tool_name: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStats {
    /// Index of the most recently appended event, or -1 if the session has
    /// produced no events yet.
    pub last_index: i64,
    pub dropped_events: u64,
}

struct Inner {
    ring: VecDeque<IndexedEvent>,
    capacity: usize,
    next_index: u64,
    dropped_events: u64,
}

/// Bounded, indexed, single-writer event ring for one session.
///
/// Indexes are global to the session (monotonically increasing from 0) even
/// as old events are evicted from the ring — `since(i)` only ever returns
/// events still resident, which is always a suffix of what was appended
/// since the buffer never reorders.
pub struct EventBuffer {
    inner: Mutex<Inner>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                next_index: 0,
                dropped_events: 0,
            }),
        }
    }

    /// Append an event, assigning it the next index. Never blocks; evicts
    /// the oldest event (and increments `dropped_events`) if at capacity.
    pub fn append(&self, event: NewEvent) -> u64 {
        let mut inner = self.inner.lock().expect("event buffer mutex poisoned");
        let index = inner.next_index;
        inner.next_index += 1;
        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
            inner.dropped_events += 1;
        }
        inner.ring.push_back(IndexedEvent {
            index,
            kind: event.kind,
            role: event.role,
            tool_name: event.tool_name,
            text: event.text,
        });
        index
    }

    /// Events with index strictly greater than `since`, in order.
    /// `since = -1` returns everything still resident.
    pub fn since(&self, since: i64) -> Vec<IndexedEvent> {
        let inner = self.inner.lock().expect("event buffer mutex poisoned");
        inner
            .ring
            .iter()
            .filter(|e| e.index as i64 > since)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().expect("event buffer mutex poisoned");
        let last_index = inner
            .ring
            .back()
            .map(|e| e.index as i64)
            .unwrap_or(-1)
            .max(if inner.next_index == 0 { -1 } else { inner.next_index as i64 - 1 });
        BufferStats {
            last_index,
            dropped_events: inner.dropped_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_start_at_zero_and_increase() {
        let buf = EventBuffer::new(10);
        let i0 = buf.append(IndexedEvent::message("assistant", "hi"));
        let i1 = buf.append(IndexedEvent::tool("read_file"));
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        let stats = buf.stats();
        assert_eq!(stats.last_index, 1);
        assert_eq!(stats.dropped_events, 0);
    }

    #[test]
    fn empty_buffer_has_last_index_negative_one() {
        let buf = EventBuffer::new(10);
        assert_eq!(buf.stats().last_index, -1);
        assert_eq!(buf.since(-1).len(), 0);
    }

    #[test]
    fn since_returns_suffix_in_order() {
        let buf = EventBuffer::new(10);
        for i in 0..5 {
            buf.append(IndexedEvent::message("assistant", format!("msg {i}")));
        }
        let tail = buf.since(2);
        assert_eq!(tail.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn eviction_increments_dropped_events_monotonically() {
        let buf = EventBuffer::new(3);
        for i in 0..10 {
            buf.append(IndexedEvent::message("assistant", format!("msg {i}")));
        }
        let stats = buf.stats();
        assert_eq!(stats.dropped_events, 7);
        assert_eq!(stats.last_index, 9);
        // Only the last 3 events are still resident.
        let remaining = buf.since(-1);
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].index, 7);
    }

    #[test]
    fn indexes_never_regress_across_many_appends() {
        let buf = EventBuffer::new(5);
        let mut last = -1i64;
        for i in 0..50 {
            let idx = buf.append(IndexedEvent::message("assistant", format!("{i}"))) as i64;
            assert!(idx > last);
            last = idx;
        }
        assert!(buf.stats().last_index >= last);
    }
}
