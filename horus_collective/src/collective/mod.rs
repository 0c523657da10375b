//! Group operations over a [`Context`](crate::context::Context).
//!
//! Every call takes the calling node's id explicitly and must be made by all
//! nodes of the context, each on its own thread. Only one collective may be
//! in flight on a context at a time.
//!
//! - [`broadcast`]: root to every node, parent before children
//! - [`reduce`] / [`reduce_all`]: fan-in to the root, optionally fanned back out
//! - [`barrier_wait`]: tree barrier (notification reduce + broadcast)
//! - [`DisseminationBarrier`]: tree-free barrier in `ceil(log2 P)` rounds

pub mod barrier;
pub mod broadcast;
pub mod dissemination;
pub mod reduction;

pub use barrier::barrier_wait;
pub use broadcast::{broadcast, broadcast_notify};
pub use dissemination::DisseminationBarrier;
pub use reduction::{reduce, reduce_all, reduce_notify};

/// Word-wise reduction operators for [`reduce`].
///
/// Each folds `other` into `acc`; both payloads must have the same length.
pub mod ops {
    use crate::error::{CollectiveError, CollectiveResult};
    use crate::message::Message;

    fn zip_with(
        acc: &mut Message,
        other: &Message,
        f: impl Fn(u64, u64) -> u64,
    ) -> CollectiveResult<()> {
        if acc.words() != other.words() {
            return Err(CollectiveError::invalid(format!(
                "cannot combine {} words with {} words",
                acc.words(),
                other.words()
            )));
        }
        for (a, &b) in acc.payload_mut().iter_mut().zip(other.payload()) {
            *a = f(*a, b);
        }
        Ok(())
    }

    /// Wrapping sum.
    pub fn sum(acc: &mut Message, other: &Message) -> CollectiveResult<()> {
        zip_with(acc, other, u64::wrapping_add)
    }

    pub fn min(acc: &mut Message, other: &Message) -> CollectiveResult<()> {
        zip_with(acc, other, u64::min)
    }

    pub fn max(acc: &mut Message, other: &Message) -> CollectiveResult<()> {
        zip_with(acc, other, u64::max)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_word_wise_ops() {
            let mut acc = Message::from_words(&[1, 9]);
            sum(&mut acc, &Message::from_words(&[2, 3])).unwrap();
            assert_eq!(acc.payload(), &[3, 12]);
            min(&mut acc, &Message::from_words(&[5, 5])).unwrap();
            assert_eq!(acc.payload(), &[3, 5]);
            max(&mut acc, &Message::from_words(&[4, 0])).unwrap();
            assert_eq!(acc.payload(), &[4, 5]);
            assert!(sum(&mut acc, &Message::word(1)).is_err());
        }
    }
}
