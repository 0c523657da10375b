//! Caller-owned message buffers.
//!
//! Channels never take ownership of a [`Message`]: `send` copies the payload
//! words into a slot and `recv` copies them back out into the caller's buffer.

use bytemuck::Pod;

use crate::error::{CollectiveError, CollectiveResult};

/// Default buffer capacity in words (one slot payload).
pub const DEFAULT_MESSAGE_WORDS: usize = 7;

/// A payload of 64-bit words with a fixed buffer capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    words: usize,
    data: Vec<u64>,
}

impl Default for Message {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MESSAGE_WORDS)
    }
}

impl Message {
    /// Empty message able to hold `capacity` words.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: 0,
            data: vec![0; capacity],
        }
    }

    /// Zero-word message used for notifications.
    pub fn notification() -> Self {
        Self::with_capacity(0)
    }

    /// Message whose payload (and capacity) is exactly `words`.
    pub fn from_words(words: &[u64]) -> Self {
        Self {
            words: words.len(),
            data: words.to_vec(),
        }
    }

    /// Single-word message.
    pub fn word(value: u64) -> Self {
        Self::from_words(&[value])
    }

    /// Encode a plain-old-data value into payload words (zero padded).
    pub fn from_value<T: Pod>(value: &T) -> Self {
        let bytes = bytemuck::bytes_of(value);
        let words = bytes.len().div_ceil(8);
        let mut data = vec![0u64; words];
        bytemuck::cast_slice_mut::<u64, u8>(&mut data)[..bytes.len()].copy_from_slice(bytes);
        Self { words, data }
    }

    /// Decode a plain-old-data value from the payload, if it is long enough.
    pub fn value<T: Pod>(&self) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let bytes = bytemuck::cast_slice::<u64, u8>(self.payload());
        if bytes.len() < size {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Number of valid payload words.
    #[inline]
    pub fn words(&self) -> usize {
        self.words
    }

    /// Buffer capacity in words.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// The valid payload words.
    #[inline]
    pub fn payload(&self) -> &[u64] {
        &self.data[..self.words]
    }

    /// First payload word, or 0 for an empty message.
    pub fn first_word(&self) -> u64 {
        self.payload().first().copied().unwrap_or(0)
    }

    /// Mutable view of the valid payload words.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u64] {
        &mut self.data[..self.words]
    }

    /// The whole buffer, used by receivers to copy a slot out.
    #[inline]
    pub(crate) fn buffer_mut(&mut self) -> &mut [u64] {
        &mut self.data
    }

    /// Set the number of valid words after an external write into the buffer.
    pub fn set_words(&mut self, words: usize) -> CollectiveResult<()> {
        if words > self.capacity() {
            return Err(CollectiveError::invalid(format!(
                "{} words exceed message capacity {}",
                words,
                self.capacity()
            )));
        }
        self.words = words;
        Ok(())
    }

    /// Replace the payload with `words`.
    pub fn write(&mut self, words: &[u64]) -> CollectiveResult<()> {
        if words.len() > self.capacity() {
            return Err(CollectiveError::invalid(format!(
                "{} words exceed message capacity {}",
                words.len(),
                self.capacity()
            )));
        }
        self.data[..words.len()].copy_from_slice(words);
        self.words = words.len();
        Ok(())
    }

    /// Copy another message's payload into this buffer.
    pub fn copy_from(&mut self, other: &Message) -> CollectiveResult<()> {
        self.write(other.payload())
    }

    pub fn clear(&mut self) {
        self.words = 0;
    }
}
