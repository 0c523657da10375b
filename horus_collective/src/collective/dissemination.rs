//! Dissemination barrier.
//!
//! Independent of any topology: participant `i` notifies `(i + 2^r) mod P`
//! and waits for `(i - 2^r) mod P` in each round `r < ceil(log2 P)`. Every
//! directed link carries the messages of exactly one round, so FIFO order on
//! the link keeps consecutive `wait` calls apart as long as all participants
//! call `wait` the same number of times.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};

use crate::channel::primitives::{bump, CachePadded};
use crate::channel::{Channel, RetryPolicy};
use crate::config::CollectiveConfig;
use crate::error::{CollectiveError, CollectiveResult};
use crate::node::Node;
use crate::platform::{NumaAllocator, SystemAllocator};
use crate::queuepair::{Endpoint, QueueOptions, QueuePair};
use crate::utils::ceil_log2;

/// Barrier state for `P` participants.
#[derive(Debug)]
pub struct DisseminationBarrier {
    participants: Vec<Node>,
    rounds: u32,
    /// Pair for participants `lo < hi` at `lo * P + hi`
    links: Vec<Option<QueuePair>>,
    exchanges: Vec<CachePadded<AtomicU64>>,
    retry: RetryPolicy,
}

impl DisseminationBarrier {
    /// One participant per core, indices in list order.
    pub fn from_cores(cores: &[usize]) -> CollectiveResult<Self> {
        Self::new(
            &Node::from_cores(cores),
            &CollectiveConfig::default(),
            &SystemAllocator,
        )
    }

    /// Allocate the links every round needs.
    pub fn new(
        participants: &[Node],
        config: &CollectiveConfig,
        alloc: &dyn NumaAllocator,
    ) -> CollectiveResult<Self> {
        config.validate()?;
        let p = participants.len();
        if p == 0 {
            return Err(CollectiveError::invalid("barrier needs at least one participant"));
        }
        let rounds = ceil_log2(p);
        let options = QueueOptions::from(config);

        let mut links: Vec<Option<QueuePair>> = Vec::new();
        links.resize_with(p * p, || None);
        for i in 0..p {
            for r in 0..rounds {
                let j = (i + (1usize << r)) % p;
                let (lo, hi) = (i.min(j), i.max(j));
                if links[lo * p + hi].is_none() {
                    let pair = QueuePair::create(participants[lo], participants[hi], options, alloc)?;
                    links[lo * p + hi] = Some(pair);
                }
            }
        }

        info!(
            "dissemination barrier: {} participants, {} rounds, {} links",
            p,
            rounds,
            links.iter().filter(|l| l.is_some()).count()
        );

        Ok(Self {
            participants: participants.to_vec(),
            rounds,
            links,
            exchanges: (0..p).map(|_| CachePadded(AtomicU64::new(0))).collect(),
            retry: config.retry_policy(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn participants(&self) -> &[Node] {
        &self.participants
    }

    /// Rounds per `wait`: `ceil(log2 P)`.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Index of the participant running as `node`.
    pub fn index_of(&self, node: &Node) -> Option<usize> {
        self.participants.iter().position(|p| p == node)
    }

    /// Message exchanges completed by `participant` so far.
    pub fn exchanges(&self, participant: usize) -> u64 {
        self.exchanges
            .get(participant)
            .map(|c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn endpoint(&self, from: usize, to: usize) -> CollectiveResult<&Endpoint> {
        let p = self.participants.len();
        let (lo, hi) = (from.min(to), from.max(to));
        let pair = self.links[lo * p + hi]
            .as_ref()
            .ok_or_else(|| crate::collective_internal!("no link between {} and {}", lo, hi))?;
        Ok(if from == lo { pair.src() } else { pair.dst() })
    }

    /// Block until every participant has called `wait` as often as this one.
    pub fn wait(&self, participant: usize) -> CollectiveResult<()> {
        let p = self.participants.len();
        if participant >= p {
            return Err(CollectiveError::invalid(format!(
                "participant {} outside 0..{}",
                participant, p
            )));
        }
        for r in 0..self.rounds {
            let step = 1usize << r;
            let to = (participant + step) % p;
            let from = (participant + p - step) % p;

            self.endpoint(participant, to)?.notify(&self.retry)?;
            self.endpoint(participant, from)?
                .recv_notification(&self.retry)?;
            bump(&self.exchanges[participant].0);
        }
        Ok(())
    }

    /// Consume the barrier. Its links are freed when it drops; callers must
    /// ensure no participant is waiting.
    pub fn destroy(self) {
        debug!(
            "destroying dissemination barrier for {} participants",
            self.participants.len()
        );
    }
}
