//! Fixed-capacity event log shared by producers and the IPC server
//!
//! Producers push newline-terminated JSON lines; each IPC client keeps its
//! own cursor (a total-push sequence number) and copies out whatever it has
//! not seen yet. Once full, the oldest slot is overwritten. A client that
//! falls more than `N` messages behind skips forward and loses the gap.

use parking_lot::Mutex;

/// Slot size in bytes, newline included
pub const MSG_SIZE: usize = 256;

/// Default slot count
pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Clone, Copy)]
struct Slot {
    data: [u8; MSG_SIZE],
    len: u16,
}

impl Slot {
    const EMPTY: Slot = Slot {
        data: [0u8; MSG_SIZE],
        len: 0,
    };

    fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

struct RingInner {
    slots: Box<[Slot]>,
    /// Next slot to write
    head: usize,
    /// Messages pushed since creation
    total: u64,
}

/// Result of copying a client's backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Cursor to store for the next call
    pub cursor: u64,
    /// Messages copied into the output buffer
    pub copied: usize,
    /// Messages lost because the client fell behind
    pub skipped: u64,
}

/// Thread-safe ring of event lines
///
/// Generic const parameter `N` sets the slot count.
pub struct EventRing<const N: usize = DEFAULT_CAPACITY> {
    inner: Mutex<RingInner>,
}

impl<const N: usize> EventRing<N> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: vec![Slot::EMPTY; N].into_boxed_slice(),
                head: 0,
                total: 0,
            }),
        }
    }

    /// Append a message, overwriting the oldest once full
    ///
    /// Messages longer than a slot are cut on a character boundary, keeping
    /// the trailing newline.
    pub fn push(&self, msg: &str) {
        let bytes = truncate_line(msg);

        let mut inner = self.inner.lock();
        let head = inner.head;
        let slot = &mut inner.slots[head];
        slot.data[..bytes.len()].copy_from_slice(bytes);
        if bytes.len() < msg.len() && msg.ends_with('\n') {
            slot.data[bytes.len()] = b'\n';
            slot.len = (bytes.len() + 1) as u16;
        } else {
            slot.len = bytes.len() as u16;
        }
        inner.head = (head + 1) % N;
        inner.total += 1;
    }

    /// `(head, total)` at this instant
    pub fn snapshot(&self) -> (usize, u64) {
        let inner = self.inner.lock();
        (inner.head, inner.total)
    }

    /// Messages pushed so far, the starting cursor for a new reader
    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    /// Copy every message after `cursor` into `out`
    ///
    /// The lock is held only while copying; callers write `out` to sockets
    /// afterwards.
    pub fn drain_since(&self, cursor: u64, out: &mut Vec<u8>) -> Drain {
        let inner = self.inner.lock();
        let total = inner.total;

        let mut pending = total.saturating_sub(cursor);
        let mut skipped = 0;
        if pending > N as u64 {
            skipped = pending - N as u64;
            pending = N as u64;
        }

        let start = (inner.head + N - pending as usize) % N;
        for i in 0..pending as usize {
            out.extend_from_slice(inner.slots[(start + i) % N].as_bytes());
        }

        Drain {
            cursor: total,
            copied: pending as usize,
            skipped,
        }
    }
}

impl<const N: usize> Default for EventRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest prefix that fits a slot (leaving room for `\n` when cut)
fn truncate_line(msg: &str) -> &[u8] {
    if msg.len() <= MSG_SIZE {
        return msg.as_bytes();
    }
    let mut end = MSG_SIZE - 1;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg.as_bytes()[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(buf: &[u8]) -> Vec<String> {
        String::from_utf8(buf.to_vec())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_push_and_drain() {
        let ring: EventRing<8> = EventRing::new();
        ring.push("a\n");
        ring.push("b\n");
        assert_eq!(ring.snapshot(), (2, 2));

        let mut out = Vec::new();
        let drain = ring.drain_since(0, &mut out);
        assert_eq!(lines(&out), vec!["a", "b"]);
        assert_eq!(drain.cursor, 2);
        assert_eq!(drain.copied, 2);
        assert_eq!(drain.skipped, 0);

        out.clear();
        let drain = ring.drain_since(drain.cursor, &mut out);
        assert!(out.is_empty());
        assert_eq!(drain.copied, 0);
    }

    #[test]
    fn test_new_reader_starts_at_total() {
        let ring: EventRing<8> = EventRing::new();
        ring.push("old\n");
        let cursor = ring.total();
        ring.push("new\n");

        let mut out = Vec::new();
        ring.drain_since(cursor, &mut out);
        assert_eq!(lines(&out), vec!["new"]);
    }

    #[test]
    fn test_overwrite_oldest() {
        let ring: EventRing<4> = EventRing::new();
        for i in 0..6 {
            ring.push(&format!("{}\n", i));
        }
        assert_eq!(ring.snapshot(), (2, 6));

        let mut out = Vec::new();
        ring.drain_since(2, &mut out);
        assert_eq!(lines(&out), vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn test_lagging_cursor_skips_forward() {
        let ring: EventRing<4> = EventRing::new();
        for i in 0..10 {
            ring.push(&format!("{}\n", i));
        }

        let mut out = Vec::new();
        let drain = ring.drain_since(1, &mut out);
        assert_eq!(drain.skipped, 5);
        assert_eq!(drain.copied, 4);
        assert_eq!(drain.cursor, 10);
        assert_eq!(lines(&out), vec!["6", "7", "8", "9"]);
    }

    #[test]
    fn test_long_message_truncated_keeps_newline() {
        let ring: EventRing<2> = EventRing::new();
        let long = format!("{}\n", "é".repeat(200));
        ring.push(&long);

        let mut out = Vec::new();
        ring.drain_since(0, &mut out);
        assert!(out.len() <= MSG_SIZE);
        assert_eq!(out.last(), Some(&b'\n'));
        let text = String::from_utf8(out).unwrap();
        assert!(text.trim_end().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        use std::thread;

        let ring: Arc<EventRing<1024>> = Arc::new(EventRing::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..100 {
                        ring.push(&format!("{}-{}\n", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut out = Vec::new();
        let drain = ring.drain_since(0, &mut out);
        assert_eq!(drain.copied, 400);
        assert_eq!(lines(&out).len(), 400);
    }
}
