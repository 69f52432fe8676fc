use std::mem;
use std::sync::Mutex;

use crate::message::Message;
use crate::message::MessageKind;

/// Bounded inbound message queue of one node.
///
/// Two buffers swap on every drain so senders never contend with the step
/// task for long. Non-local messages beyond the length or byte budget are
/// dropped; raft tolerates the loss. `LocalTick` messages are deduplicated
/// by their monotonic hint so a backlogged node does not replay a burst of
/// stale ticks.
pub(crate) struct MessageQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    max_bytes: u64,
}

struct Inner {
    queue: Vec<Message>,
    spare: Vec<Message>,
    bytes: u64,
    tick_hint: u64,
    dropped: u64,
}

impl MessageQueue {
    pub(crate) fn new(capacity: usize, max_bytes: u64) -> Self {
        MessageQueue {
            inner: Mutex::new(Inner {
                queue: Vec::with_capacity(capacity),
                spare: Vec::with_capacity(capacity),
                bytes: 0,
                tick_hint: 0,
                dropped: 0,
            }),
            capacity,
            max_bytes,
        }
    }

    /// Returns false when the message was dropped.
    pub(crate) fn add(&self, msg: Message) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if msg.kind == MessageKind::LocalTick {
            // under back-pressure ticks pile up; only the newest matters
            if msg.hint.0 <= inner.tick_hint {
                return true;
            }
            inner.tick_hint = msg.hint.0;
            inner.queue.push(msg);
            return true;
        }

        let size: u64 = msg.entries.iter().map(|e| e.size_in_bytes()).sum();
        if inner.queue.len() >= self.capacity || inner.bytes + size > self.max_bytes {
            inner.dropped += 1;
            if inner.dropped % 1000 == 1 {
                tracing::warn!(dropped = inner.dropped, "inbound message queue overflow");
            }
            return false;
        }

        inner.bytes += size;
        inner.queue.push(msg);
        true
    }

    /// Drain everything queued so far.
    pub(crate) fn get(&self) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes = 0;
        let spare = mem::take(&mut inner.spare);
        mem::replace(&mut inner.queue, spare)
    }

    /// Return the drained buffer for reuse.
    pub(crate) fn recycle(&self, mut buf: Vec<Message>) {
        buf.clear();
        let mut inner = self.inner.lock().unwrap();
        if inner.spare.capacity() < buf.capacity() {
            inner.spare = buf;
        }
    }
}
