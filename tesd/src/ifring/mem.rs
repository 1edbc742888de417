//! In-memory ring backend.
//!
//! Mirrors the NIC rings' single-producer layout: slots between tail and
//! head are owned by the producer, slots between head and tail by the
//! readers. A slot's bytes are written before the tail is published
//! (release ordering), so readers never observe a partially written
//! frame. One slot is kept vacant to distinguish a full ring from an
//! empty one.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

use super::RingBackend;

struct Slot {
    buf: UnsafeCell<Vec<u8>>,
    len: AtomicU32,
}

struct MemRing {
    slots: Vec<Slot>,
    head: AtomicU32,
    cursor: AtomicU32,
    tail: AtomicU32,
}

pub struct MemBackend {
    rings: Vec<MemRing>,
    slot_size: usize,
    notify: Notify,
}

// Safety: slot contents are only written by the producer while the slot
// is outside [head, tail), and only read by consumers while inside it;
// the tail store/load pair orders the two.
unsafe impl Sync for MemBackend {}
unsafe impl Send for MemBackend {}

impl MemBackend {
    pub fn new(num_rings: usize, num_slots: u32, slot_size: usize) -> Self {
        assert!(num_slots >= 2);
        let rings = (0..num_rings)
            .map(|_| MemRing {
                slots: (0..num_slots)
                    .map(|_| Slot {
                        buf: UnsafeCell::new(vec![0u8; slot_size]),
                        len: AtomicU32::new(0),
                    })
                    .collect(),
                head: AtomicU32::new(0),
                cursor: AtomicU32::new(0),
                tail: AtomicU32::new(0),
            })
            .collect();
        MemBackend { rings, slot_size, notify: Notify::new() }
    }

    /// Deposit one frame into a ring. Returns false when the ring is
    /// full; the frame is then lost, as it would be on the wire.
    pub fn push(&self, ring: usize, frame: &[u8]) -> bool {
        assert!(frame.len() <= self.slot_size);
        let r = &self.rings[ring];
        let n = r.slots.len() as u32;
        let tail = r.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % n;
        if next == r.head.load(Ordering::Acquire) {
            return false;
        }
        let slot = &r.slots[tail as usize];
        unsafe {
            (&mut *slot.buf.get())[..frame.len()].copy_from_slice(frame);
        }
        slot.len.store(frame.len() as u32, Ordering::Relaxed);
        r.tail.store(next, Ordering::Release);
        self.notify.notify_one();
        true
    }

    fn has_pending(&self) -> bool {
        self.rings
            .iter()
            .any(|r| r.cursor.load(Ordering::Relaxed) != r.tail.load(Ordering::Acquire))
    }
}

impl RingBackend for MemBackend {
    fn num_rings(&self) -> usize {
        self.rings.len()
    }

    fn num_slots(&self, ring: usize) -> u32 {
        self.rings[ring].slots.len() as u32
    }

    fn head(&self, ring: usize) -> u32 {
        self.rings[ring].head.load(Ordering::Acquire)
    }

    fn cursor(&self, ring: usize) -> u32 {
        self.rings[ring].cursor.load(Ordering::Acquire)
    }

    fn tail(&self, ring: usize) -> u32 {
        self.rings[ring].tail.load(Ordering::Acquire)
    }

    fn slot(&self, ring: usize, idx: u32) -> &[u8] {
        let slot = &self.rings[ring].slots[idx as usize];
        let len = slot.len.load(Ordering::Relaxed) as usize;
        unsafe { &(&*slot.buf.get())[..len] }
    }

    fn advance(&self, ring: usize, head: u32, cursor: u32) {
        let r = &self.rings[ring];
        r.head.store(head, Ordering::Release);
        r.cursor.store(cursor, Ordering::Release);
    }

    async fn wait_rx(&self) -> io::Result<()> {
        loop {
            let notified = self.notify.notified();
            if self.has_pending() {
                return Ok(());
            }
            notified.await;
        }
    }
}
