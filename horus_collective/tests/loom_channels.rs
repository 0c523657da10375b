//! Loom-based exhaustive concurrency tests for the channel protocols.
//!
//! The rings here are reduced versions of `horus_collective::channel::{ump,ffq}`
//! written against loom's atomics: two payload words per slot instead of
//! seven, but the same control-word encoding and the same
//! Relaxed/Release/Acquire pattern.
//!
//! Run with: `cargo test --test loom_channels -- --nocapture`
//!
//! Note: loom tests explore exponentially many interleavings. Keep ring
//! sizes at 2-3 lines and message counts at 2-3.

use loom::sync::atomic::{AtomicU64, Ordering};
use loom::sync::Arc;

const WORDS: usize = 2;

struct LoomSlot {
    payload: [AtomicU64; WORDS],
    ctrl: AtomicU64,
}

fn alloc_slots(n: usize) -> Vec<LoomSlot> {
    (0..n)
        .map(|_| LoomSlot {
            payload: [AtomicU64::new(0), AtomicU64::new(0)],
            ctrl: AtomicU64::new(0),
        })
        .collect()
}

/// Spin on `op` with loom-visible yields until it returns `Some`.
fn spin<T>(mut op: impl FnMut() -> Option<T>) -> T {
    loop {
        if let Some(v) = op() {
            return v;
        }
        loom::thread::yield_now();
    }
}

// ============================================================================
// Simplified UMP ring (mirrors ump.rs)
// ============================================================================

/// Line 0 is the ack line; lines 1..=num_msg are message slots.
struct LoomUmp {
    lines: Vec<LoomSlot>,
    num_msg: u64,
    // producer-local
    tx_pos: AtomicU64,
    tx_epoch: AtomicU64,
    tx_seq: AtomicU64,
    // consumer-local
    rx_pos: AtomicU64,
    rx_epoch: AtomicU64,
}

impl LoomUmp {
    fn new(slot_count: usize) -> Self {
        Self {
            lines: alloc_slots(slot_count),
            num_msg: slot_count as u64 - 1,
            tx_pos: AtomicU64::new(0),
            tx_epoch: AtomicU64::new(1),
            tx_seq: AtomicU64::new(1),
            rx_pos: AtomicU64::new(0),
            rx_epoch: AtomicU64::new(1),
        }
    }

    fn try_send(&self, words: [u64; WORDS]) -> bool {
        let seq = self.tx_seq.load(Ordering::Relaxed);
        let ack = self.lines[0].ctrl.load(Ordering::Acquire);
        if seq - ack > self.num_msg {
            return false;
        }
        let pos = self.tx_pos.load(Ordering::Relaxed);
        let epoch = self.tx_epoch.load(Ordering::Relaxed);
        let slot = &self.lines[1 + pos as usize];
        for (dst, w) in slot.payload.iter().zip(words) {
            dst.store(w, Ordering::Relaxed);
        }
        slot.ctrl.store((seq << 16) | epoch, Ordering::Release);

        if pos + 1 == self.num_msg {
            self.tx_pos.store(0, Ordering::Relaxed);
            self.tx_epoch.store(epoch ^ 1, Ordering::Relaxed);
        } else {
            self.tx_pos.store(pos + 1, Ordering::Relaxed);
        }
        self.tx_seq.store(seq + 1, Ordering::Relaxed);
        true
    }

    fn try_recv(&self) -> Option<[u64; WORDS]> {
        let pos = self.rx_pos.load(Ordering::Relaxed);
        let epoch = self.rx_epoch.load(Ordering::Relaxed);
        let slot = &self.lines[1 + pos as usize];
        let ctrl = slot.ctrl.load(Ordering::Acquire);
        if ctrl & 0xffff != epoch {
            return None;
        }
        let out = [
            slot.payload[0].load(Ordering::Relaxed),
            slot.payload[1].load(Ordering::Relaxed),
        ];
        if pos + 1 == self.num_msg {
            self.rx_pos.store(0, Ordering::Relaxed);
            self.rx_epoch.store(epoch ^ 1, Ordering::Relaxed);
        } else {
            self.rx_pos.store(pos + 1, Ordering::Relaxed);
        }
        self.lines[0].ctrl.store(ctrl >> 16, Ordering::Release);
        Some(out)
    }
}

// ============================================================================
// Simplified FFQ ring (mirrors ffq.rs)
// ============================================================================

struct LoomFfq {
    slots: Vec<LoomSlot>,
    tx_pos: AtomicU64,
    rx_pos: AtomicU64,
}

impl LoomFfq {
    fn new(slot_count: usize) -> Self {
        Self {
            slots: alloc_slots(slot_count),
            tx_pos: AtomicU64::new(0),
            rx_pos: AtomicU64::new(0),
        }
    }

    fn try_send(&self, words: [u64; WORDS]) -> bool {
        let pos = self.tx_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos as usize];
        if slot.ctrl.load(Ordering::Acquire) != 0 {
            return false;
        }
        for (dst, w) in slot.payload.iter().zip(words) {
            dst.store(w, Ordering::Relaxed);
        }
        slot.ctrl.store(1 << 63, Ordering::Release);
        self.tx_pos
            .store((pos + 1) % self.slots.len() as u64, Ordering::Relaxed);
        true
    }

    fn try_recv(&self) -> Option<[u64; WORDS]> {
        let pos = self.rx_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos as usize];
        if slot.ctrl.load(Ordering::Acquire) == 0 {
            return None;
        }
        let out = [
            slot.payload[0].load(Ordering::Relaxed),
            slot.payload[1].load(Ordering::Relaxed),
        ];
        slot.ctrl.store(0, Ordering::Release);
        self.rx_pos
            .store((pos + 1) % self.slots.len() as u64, Ordering::Relaxed);
        Some(out)
    }
}

// ============================================================================
// LOOM TESTS: UMP
// ============================================================================

#[test]
fn loom_ump_payload_visible_with_control_word() {
    // A ready control word must never expose a stale payload.
    loom::model(|| {
        let ring = Arc::new(LoomUmp::new(2));
        let r = ring.clone();

        let producer = loom::thread::spawn(move || {
            assert!(r.try_send([7, 8]));
        });

        let early = ring.try_recv();
        producer.join().unwrap();

        match early {
            Some(words) => assert_eq!(words, [7, 8]),
            None => assert_eq!(ring.try_recv(), Some([7, 8])),
        }
    });
}

#[test]
fn loom_ump_wrap_reuses_slot_after_ack() {
    // One message slot: the second send must wait for the ack and the
    // receiver must flip its epoch to see it.
    loom::model(|| {
        let ring = Arc::new(LoomUmp::new(2));
        let r = ring.clone();

        let producer = loom::thread::spawn(move || {
            spin(|| r.try_send([1, 10]).then_some(()));
            spin(|| r.try_send([2, 20]).then_some(()));
        });

        let first = spin(|| ring.try_recv());
        let second = spin(|| ring.try_recv());
        producer.join().unwrap();

        assert_eq!(first, [1, 10]);
        assert_eq!(second, [2, 20]);
        assert_eq!(ring.try_recv(), None);
    });
}

#[test]
fn loom_ump_full_ring_rejects() {
    loom::model(|| {
        let ring = Arc::new(LoomUmp::new(3));
        assert!(ring.try_send([1, 1]));
        assert!(ring.try_send([2, 2]));

        let r = ring.clone();
        let consumer = loom::thread::spawn(move || r.try_recv());

        let third = ring.try_send([3, 3]);
        let consumed = consumer.join().unwrap();
        assert_eq!(consumed, Some([1, 1]));

        let mut remaining = Vec::new();
        while let Some(v) = ring.try_recv() {
            remaining.push(v[0]);
        }
        let expected: Vec<u64> = if third { vec![2, 3] } else { vec![2] };
        assert_eq!(remaining, expected);
    });
}

// ============================================================================
// LOOM TESTS: FFQ
// ============================================================================

#[test]
fn loom_ffq_single_slot_handoff() {
    loom::model(|| {
        let ring = Arc::new(LoomFfq::new(1));
        let r = ring.clone();

        let producer = loom::thread::spawn(move || {
            spin(|| r.try_send([5, 50]).then_some(()));
            spin(|| r.try_send([6, 60]).then_some(()));
        });

        assert_eq!(spin(|| ring.try_recv()), [5, 50]);
        assert_eq!(spin(|| ring.try_recv()), [6, 60]);
        producer.join().unwrap();
    });
}
