//! Shared primitives for the channel implementations.
//!
//! Contains `CachePadded<T>` for false-sharing avoidance, the cache-line
//! [`Slot`] layout every backend overlays on its buffer, and [`SlotRing`], the
//! shared view of a zeroed [`AlignedBuffer`] as an array of slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::platform::{AlignedBuffer, CACHELINE_SIZE};

/// Payload words carried by one slot (the eighth word is the control word).
pub const PAYLOAD_WORDS: usize = 7;

/// Largest slot count addressable by the 16-bit ring indices.
pub const MAX_SLOTS: usize = u16::MAX as usize;

/// Cache-line aligned wrapper to prevent false sharing between producer and consumer.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub(crate) struct CachePadded<T>(pub T);

/// One cache line of a channel buffer.
///
/// All-zero bytes are a valid (empty) slot, so a zeroed buffer needs no
/// further initialisation.
#[repr(C, align(64))]
pub(crate) struct Slot {
    pub payload: [AtomicU64; PAYLOAD_WORDS],
    pub ctrl: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<Slot>() == CACHELINE_SIZE);

impl Slot {
    /// Copy `words` into the payload. Must precede the control-word release store.
    #[inline]
    pub fn write_payload(&self, words: &[u64]) {
        for (dst, &w) in self.payload.iter().zip(words) {
            dst.store(w, Ordering::Relaxed);
        }
    }

    /// Copy `count` payload words into `msg`. Must follow the control-word acquire load.
    #[inline]
    pub fn read_payload(&self, msg: &mut Message, count: usize) -> CollectiveResult<()> {
        let buf = msg.buffer_mut();
        if count > buf.len() {
            return Err(CollectiveError::invalid(format!(
                "receive buffer holds {} words, message has {}",
                buf.len(),
                count
            )));
        }
        for (dst, src) in buf[..count].iter_mut().zip(&self.payload) {
            *dst = src.load(Ordering::Relaxed);
        }
        msg.set_words(count)
    }
}

/// Reject payloads that do not fit a slot.
#[inline]
pub(crate) fn check_payload(msg: &Message) -> CollectiveResult<()> {
    if msg.words() > PAYLOAD_WORDS {
        return Err(CollectiveError::PayloadTooLarge {
            words: msg.words(),
            max: PAYLOAD_WORDS,
        });
    }
    Ok(())
}

/// Increment a counter that only the calling thread writes.
///
/// A plain load and store; readers on other cores may see a stale value but
/// never a torn one.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    let v = counter.load(Ordering::Relaxed);
    counter.store(v.wrapping_add(1), Ordering::Relaxed);
}

/// A buffer viewed as `len` cache-line slots, shared by both ends of a channel.
#[derive(Debug, Clone)]
pub(crate) struct SlotRing {
    buf: Arc<AlignedBuffer>,
    len: usize,
}

impl SlotRing {
    /// Validate `buf` for `lines` slots.
    pub fn new(buf: Arc<AlignedBuffer>, lines: usize) -> CollectiveResult<Self> {
        if !buf.is_aligned_to(CACHELINE_SIZE) {
            return Err(CollectiveError::alignment(format!(
                "channel buffer at {:p} is not {}-byte aligned",
                buf.as_ptr(),
                CACHELINE_SIZE
            )));
        }
        let needed = lines
            .checked_mul(CACHELINE_SIZE)
            .ok_or_else(|| CollectiveError::invalid("slot count overflows buffer size"))?;
        if buf.len() < needed {
            return Err(CollectiveError::invalid(format!(
                "channel buffer of {} bytes cannot hold {} slots",
                buf.len(),
                lines
            )));
        }
        Ok(Self { buf, len: lines })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &Slot {
        debug_assert!(idx < self.len);
        // SAFETY: the buffer is cache-line aligned, zero-initialised and at
        // least `len` lines long (checked in `new`); `Slot` consists solely of
        // atomics, for which all-zero is a valid bit pattern.
        unsafe { &*(self.buf.as_ptr() as *const Slot).add(idx) }
    }

    /// Zero every line. Only valid before the other side starts using the ring.
    pub fn clear(&self) {
        for i in 0..self.len {
            let slot = self.slot(i);
            for w in &slot.payload {
                w.store(0, Ordering::Relaxed);
            }
            slot.ctrl.store(0, Ordering::Release);
        }
    }
}
