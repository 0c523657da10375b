//! Single-writer multi-reader ring for shared-memory clusters.
//!
//! Buffer layout:
//!
//! ```text
//! line 0..R        : reader lines, ctrl = last sequence number consumed
//! line R..R+S      : message slots, ctrl = words << 48 | seq
//! ```
//!
//! Every reader sees every message. The writer may publish sequence `s` while
//! `s - min(reader) <= S`, so a slot is only overwritten after all readers
//! have consumed it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::primitives::{check_payload, SlotRing, MAX_SLOTS};
use super::{Receiver, Sender};
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::platform::{AlignedBuffer, CACHELINE_SIZE};
use crate::utils::{likely, unlikely};

const SEQ_MASK: u64 = (1 << 48) - 1;

/// Bytes needed for `slots` message slots shared by `readers` readers.
pub fn buffer_bytes(slots: usize, readers: usize) -> usize {
    (slots + readers) * CACHELINE_SIZE
}

/// The coordinator's publishing half.
#[derive(Debug)]
pub struct SwmrWriter {
    ring: SlotRing,
    readers: usize,
    slots: usize,
    seq: AtomicU64,
    cached_min: AtomicU64,
}

impl SwmrWriter {
    pub fn readers(&self) -> usize {
        self.readers
    }

    fn min_consumed(&self) -> u64 {
        (0..self.readers)
            .map(|r| self.ring.slot(r).ctrl.load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.seq.load(Ordering::Relaxed).wrapping_sub(1))
    }

    #[inline]
    fn has_room(&self, seq: u64) -> bool {
        if likely(seq - self.cached_min.load(Ordering::Relaxed) <= self.slots as u64) {
            return true;
        }
        let min = self.min_consumed();
        self.cached_min.store(min, Ordering::Relaxed);
        seq - min <= self.slots as u64
    }

    fn push(&self, words: &[u64]) -> CollectiveResult<()> {
        let seq = self.seq.load(Ordering::Relaxed);
        if unlikely(!self.has_room(seq)) {
            return Err(CollectiveError::QueueFull);
        }
        let slot = self.ring.slot(self.readers + ((seq - 1) % self.slots as u64) as usize);
        slot.write_payload(words);
        slot.ctrl
            .store(((words.len() as u64) << 48) | seq, Ordering::Release);
        self.seq.store(seq + 1, Ordering::Relaxed);
        Ok(())
    }
}

impl Sender for SwmrWriter {
    fn try_send(&self, msg: &Message) -> CollectiveResult<()> {
        check_payload(msg)?;
        self.push(msg.payload())
    }

    fn try_notify(&self) -> CollectiveResult<()> {
        self.push(&[])
    }

    fn can_send(&self) -> bool {
        self.has_room(self.seq.load(Ordering::Relaxed))
    }

    fn capacity(&self) -> usize {
        self.slots
    }
}

/// One member's reading half.
#[derive(Debug)]
pub struct SwmrReader {
    ring: SlotRing,
    index: usize,
    readers: usize,
    slots: usize,
    next: AtomicU64,
}

impl SwmrReader {
    /// Position of this reader within the cluster.
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    fn ready_ctrl(&self) -> Option<u64> {
        let next = self.next.load(Ordering::Relaxed);
        let slot = self.ring.slot(self.readers + ((next - 1) % self.slots as u64) as usize);
        let ctrl = slot.ctrl.load(Ordering::Acquire);
        (ctrl & SEQ_MASK == next).then_some(ctrl)
    }
}

impl Receiver for SwmrReader {
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        let Some(ctrl) = self.ready_ctrl() else {
            return Err(CollectiveError::QueueEmpty);
        };
        let next = self.next.load(Ordering::Relaxed);
        let slot = self.ring.slot(self.readers + ((next - 1) % self.slots as u64) as usize);
        slot.read_payload(msg, (ctrl >> 48) as usize)?;
        self.ring.slot(self.index).ctrl.store(next, Ordering::Release);
        self.next.store(next + 1, Ordering::Relaxed);
        Ok(())
    }

    fn can_recv(&self) -> bool {
        self.ready_ctrl().is_some()
    }

    fn capacity(&self) -> usize {
        self.slots
    }
}

/// Build the writer and `readers` readers over one zeroed buffer.
pub fn swmr_channel(
    buf: Arc<AlignedBuffer>,
    slots: usize,
    readers: usize,
) -> CollectiveResult<(SwmrWriter, Vec<SwmrReader>)> {
    if !(1..=MAX_SLOTS).contains(&slots) || !(1..=MAX_SLOTS).contains(&readers) {
        return Err(CollectiveError::invalid(format!(
            "SWMR ring needs 1..={} slots and readers, got {} slots, {} readers",
            MAX_SLOTS, slots, readers
        )));
    }
    let ring = SlotRing::new(buf, slots + readers)?;
    ring.clear();

    let members = (0..readers)
        .map(|index| SwmrReader {
            ring: ring.clone(),
            index,
            readers,
            slots,
            next: AtomicU64::new(1),
        })
        .collect();
    let writer = SwmrWriter {
        ring,
        readers,
        slots,
        seq: AtomicU64::new(1),
        cached_min: AtomicU64::new(0),
    };
    Ok((writer, members))
}
