//! FastForward SPSC ring (FFQ backend).
//!
//! Every line of the buffer is a message slot. A slot's control word is 0
//! while empty and `FULL | words << 32 | seq` while it holds a message; the
//! consumer clears it after copying the payload out, handing the slot back.
//! No shared cursor or ack word exists, so capacity equals the slot count.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use super::primitives::{check_payload, SlotRing, MAX_SLOTS};
use super::{Receiver, Sender};
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::platform::AlignedBuffer;
use crate::utils::unlikely;

const FULL: u64 = 1 << 63;

#[inline]
fn ctrl_words(ctrl: u64) -> usize {
    ((ctrl >> 32) & 0xff) as usize
}

fn validate_slots(slot_count: usize) -> CollectiveResult<()> {
    if !(1..=MAX_SLOTS).contains(&slot_count) {
        return Err(CollectiveError::invalid(format!(
            "FFQ ring needs 1..={} slots, got {}",
            MAX_SLOTS, slot_count
        )));
    }
    Ok(())
}

/// Producer half of an FFQ ring.
#[derive(Debug)]
pub struct FfqTx {
    ring: SlotRing,
    pos: AtomicUsize,
    seq: AtomicU32,
}

impl FfqTx {
    /// Attach the producer to `buf` and mark every slot empty.
    pub fn init_tx(buf: Arc<AlignedBuffer>, slot_count: usize) -> CollectiveResult<Self> {
        validate_slots(slot_count)?;
        let ring = SlotRing::new(buf, slot_count)?;
        ring.clear();
        Ok(Self {
            ring,
            pos: AtomicUsize::new(0),
            seq: AtomicU32::new(1),
        })
    }

    /// Sequence number the next message will carry.
    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }

    fn push(&self, words: &[u64]) -> CollectiveResult<()> {
        let pos = self.pos.load(Ordering::Relaxed);
        let slot = self.ring.slot(pos);
        if unlikely(slot.ctrl.load(Ordering::Acquire) != 0) {
            return Err(CollectiveError::QueueFull);
        }
        let seq = self.seq.load(Ordering::Relaxed);
        slot.write_payload(words);
        slot.ctrl
            .store(FULL | ((words.len() as u64) << 32) | seq as u64, Ordering::Release);

        self.pos.store((pos + 1) % self.ring.len(), Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }
}

impl Sender for FfqTx {
    fn try_send(&self, msg: &Message) -> CollectiveResult<()> {
        check_payload(msg)?;
        self.push(msg.payload())
    }

    fn try_notify(&self) -> CollectiveResult<()> {
        self.push(&[])
    }

    fn can_send(&self) -> bool {
        let pos = self.pos.load(Ordering::Relaxed);
        self.ring.slot(pos).ctrl.load(Ordering::Acquire) == 0
    }

    fn capacity(&self) -> usize {
        self.ring.len()
    }
}

/// Consumer half of an FFQ ring.
#[derive(Debug)]
pub struct FfqRx {
    ring: SlotRing,
    pos: AtomicUsize,
}

impl FfqRx {
    /// Attach the consumer to `buf`. The buffer is not touched.
    pub fn init_rx(buf: Arc<AlignedBuffer>, slot_count: usize) -> CollectiveResult<Self> {
        validate_slots(slot_count)?;
        let ring = SlotRing::new(buf, slot_count)?;
        Ok(Self {
            ring,
            pos: AtomicUsize::new(0),
        })
    }
}

impl Receiver for FfqRx {
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        let pos = self.pos.load(Ordering::Relaxed);
        let slot = self.ring.slot(pos);
        let ctrl = slot.ctrl.load(Ordering::Acquire);
        if unlikely(ctrl == 0) {
            return Err(CollectiveError::QueueEmpty);
        }
        slot.read_payload(msg, ctrl_words(ctrl))?;
        // Hands the slot back; payload reads are ordered before it
        slot.ctrl.store(0, Ordering::Release);
        self.pos.store((pos + 1) % self.ring.len(), Ordering::Relaxed);
        Ok(())
    }

    fn can_recv(&self) -> bool {
        let pos = self.pos.load(Ordering::Relaxed);
        self.ring.slot(pos).ctrl.load(Ordering::Acquire) != 0
    }

    fn capacity(&self) -> usize {
        self.ring.len()
    }
}

/// Producer and consumer attached to one shared buffer.
pub fn ffq_channel(buf: Arc<AlignedBuffer>, slot_count: usize) -> CollectiveResult<(FfqTx, FfqRx)> {
    let tx = FfqTx::init_tx(buf.clone(), slot_count)?;
    let rx = FfqRx::init_rx(buf, slot_count)?;
    Ok((tx, rx))
}
