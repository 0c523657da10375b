//! Epoch-bit SPSC ring (UMP backend).
//!
//! Buffer layout, one cache line per entry:
//!
//! ```text
//! line 0       : ack line   (ctrl = last sequence number consumed by the receiver)
//! line 1..S    : message slots, payload[0..7] + ctrl
//! ctrl         : words << 32 | seq << 16 | epoch
//! ```
//!
//! A slot is ready exactly when its epoch equals the receiver's expected
//! epoch; both sides flip their epoch each time their cursor wraps. The
//! producer admits a message while `seq - last_ack <= S - 1`, reading the
//! remote ack word only when its cached copy says the ring is full.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::primitives::{check_payload, SlotRing, MAX_SLOTS};
use super::{Receiver, Sender};
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::platform::{AlignedBuffer, CACHELINE_SIZE};
use crate::utils::{likely, unlikely};

const EPOCH_MASK: u64 = 0xffff;
const ACK_LINE: usize = 0;
const FIRST_SLOT: usize = 1;

/// When the receiver publishes its acknowledgement word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// After every received message; the sender sees the full `S - 1` capacity.
    #[default]
    EveryMessage,
    /// Only when the receive cursor wraps; fewer cross-core writes, but the
    /// sender stalls once per lap until the receiver catches up.
    OnWrap,
}

#[inline]
fn encode(words: usize, seq: u16, epoch: u64) -> u64 {
    ((words as u64) << 32) | ((seq as u64) << 16) | epoch
}

#[inline]
fn ctrl_epoch(ctrl: u64) -> u64 {
    ctrl & EPOCH_MASK
}

#[inline]
fn ctrl_seq(ctrl: u64) -> u16 {
    (ctrl >> 16) as u16
}

#[inline]
fn ctrl_words(ctrl: u64) -> usize {
    ((ctrl >> 32) & 0xff) as usize
}

/// Bytes needed for a ring of `slot_count` lines.
pub fn buffer_bytes(slot_count: usize) -> usize {
    slot_count * CACHELINE_SIZE
}

fn validate_slots(slot_count: usize) -> CollectiveResult<()> {
    if !(2..=MAX_SLOTS).contains(&slot_count) {
        return Err(CollectiveError::invalid(format!(
            "UMP ring needs 2..={} slots, got {}",
            MAX_SLOTS, slot_count
        )));
    }
    Ok(())
}

/// Producer half of a UMP ring.
///
/// Cursor state is kept in relaxed atomics so the handle can be shared; it
/// must still be driven by one thread at a time.
#[derive(Debug)]
pub struct UmpTx {
    ring: SlotRing,
    num_msg: usize,
    pos: AtomicUsize,
    epoch: AtomicU64,
    seq: AtomicU16,
    cached_ack: AtomicU16,
}

impl UmpTx {
    /// Attach the producer to `buf` and zero every slot.
    pub fn init_tx(buf: Arc<AlignedBuffer>, slot_count: usize) -> CollectiveResult<Self> {
        validate_slots(slot_count)?;
        let ring = SlotRing::new(buf, slot_count)?;
        ring.clear();
        Ok(Self {
            ring,
            num_msg: slot_count - 1,
            pos: AtomicUsize::new(0),
            epoch: AtomicU64::new(1),
            seq: AtomicU16::new(1),
            cached_ack: AtomicU16::new(0),
        })
    }

    /// Sequence number the next message will carry.
    pub fn sequence(&self) -> u16 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Last acknowledgement observed from the receiver.
    pub fn last_ack(&self) -> u16 {
        self.cached_ack.load(Ordering::Relaxed)
    }

    /// Messages sent but not yet known to be consumed.
    pub fn in_flight(&self) -> usize {
        self.sequence().wrapping_sub(self.last_ack()).wrapping_sub(1) as usize
    }

    #[inline]
    fn has_room(&self, seq: u16) -> bool {
        let ack = self.cached_ack.load(Ordering::Relaxed);
        if likely(seq.wrapping_sub(ack) as usize <= self.num_msg) {
            return true;
        }
        let ack = self.ring.slot(ACK_LINE).ctrl.load(Ordering::Acquire) as u16;
        self.cached_ack.store(ack, Ordering::Relaxed);
        seq.wrapping_sub(ack) as usize <= self.num_msg
    }

    #[inline]
    fn push(&self, words: &[u64]) -> CollectiveResult<()> {
        let seq = self.seq.load(Ordering::Relaxed);
        if unlikely(!self.has_room(seq)) {
            return Err(CollectiveError::QueueFull);
        }

        let pos = self.pos.load(Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Relaxed);
        let slot = self.ring.slot(FIRST_SLOT + pos);
        slot.write_payload(words);
        // Publishes the payload: every store above is ordered before this one
        slot.ctrl.store(encode(words.len(), seq, epoch), Ordering::Release);

        if pos + 1 == self.num_msg {
            self.pos.store(0, Ordering::Relaxed);
            self.epoch.store(epoch ^ 1, Ordering::Relaxed);
        } else {
            self.pos.store(pos + 1, Ordering::Relaxed);
        }
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        Ok(())
    }
}

impl Sender for UmpTx {
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
        self.num_msg
    }
}

/// Consumer half of a UMP ring.
#[derive(Debug)]
pub struct UmpRx {
    ring: SlotRing,
    num_msg: usize,
    ack_policy: AckPolicy,
    pos: AtomicUsize,
    epoch: AtomicU64,
}

impl UmpRx {
    /// Attach the consumer to `buf`. The buffer is not touched.
    pub fn init_rx(
        buf: Arc<AlignedBuffer>,
        slot_count: usize,
        ack_policy: AckPolicy,
    ) -> CollectiveResult<Self> {
        validate_slots(slot_count)?;
        let ring = SlotRing::new(buf, slot_count)?;
        Ok(Self {
            ring,
            num_msg: slot_count - 1,
            ack_policy,
            pos: AtomicUsize::new(0),
            epoch: AtomicU64::new(1),
        })
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    #[inline]
    fn ready_ctrl(&self) -> Option<u64> {
        let pos = self.pos.load(Ordering::Relaxed);
        let ctrl = self.ring.slot(FIRST_SLOT + pos).ctrl.load(Ordering::Acquire);
        if ctrl_epoch(ctrl) == self.epoch.load(Ordering::Relaxed) {
            Some(ctrl)
        } else {
            None
        }
    }

    fn advance(&self, ctrl: u64) {
        let pos = self.pos.load(Ordering::Relaxed) + 1;
        let wrapped = pos == self.num_msg;
        if wrapped {
            self.pos.store(0, Ordering::Relaxed);
            let epoch = self.epoch.load(Ordering::Relaxed);
            self.epoch.store(epoch ^ 1, Ordering::Relaxed);
        } else {
            self.pos.store(pos, Ordering::Relaxed);
        }
        if wrapped || self.ack_policy == AckPolicy::EveryMessage {
            // Slot reads above are ordered before the producer may reuse it
            self.ring
                .slot(ACK_LINE)
                .ctrl
                .store(ctrl_seq(ctrl) as u64, Ordering::Release);
        }
    }
}

impl Receiver for UmpRx {
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        let Some(ctrl) = self.ready_ctrl() else {
            return Err(CollectiveError::QueueEmpty);
        };
        let pos = self.pos.load(Ordering::Relaxed);
        self.ring
            .slot(FIRST_SLOT + pos)
            .read_payload(msg, ctrl_words(ctrl))?;
        self.advance(ctrl);
        Ok(())
    }

    fn can_recv(&self) -> bool {
        self.ready_ctrl().is_some()
    }

    fn capacity(&self) -> usize {
        self.num_msg
    }
}

/// Producer and consumer attached to one shared buffer.
pub fn ump_channel(
    buf: Arc<AlignedBuffer>,
    slot_count: usize,
    ack_policy: AckPolicy,
) -> CollectiveResult<(UmpTx, UmpRx)> {
    let tx = UmpTx::init_tx(buf.clone(), slot_count)?;
    let rx = UmpRx::init_rx(buf, slot_count, ack_policy)?;
    Ok((tx, rx))
}
