//! Bidirectional links between two nodes.
//!
//! A [`QueuePair`] owns two independent rings, `src -> dst` and `dst -> src`.
//! Each ring's buffer is placed on the NUMA node of the core that *reads* it,
//! so polling stays local and only the producer's stores cross the
//! interconnect. Each side talks through its own [`Endpoint`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::channel::ffq::ffq_channel;
use crate::channel::primitives::{bump, CachePadded};
use crate::channel::ump::{self, ump_channel};
use crate::channel::{
    AckPolicy, Channel, QueueKind, Receiver, RxQueue, Sender, TxQueue,
};
use crate::config::{CollectiveConfig, DEFAULT_QUEUE_SLOTS};
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::node::{Node, NodeId};
use crate::platform::{numa_node_of_cpu, AlignedBuffer, NumaAllocator, SystemAllocator, CACHELINE_SIZE};

/// Ring geometry and placement for queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub kind: QueueKind,
    /// Buffer lines per ring
    pub slots: usize,
    pub ack_policy: AckPolicy,
    /// Bind each buffer to its consumer's NUMA node
    pub numa_aware: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            kind: QueueKind::Ump,
            slots: DEFAULT_QUEUE_SLOTS,
            ack_policy: AckPolicy::EveryMessage,
            numa_aware: true,
        }
    }
}

impl From<&CollectiveConfig> for QueueOptions {
    fn from(config: &CollectiveConfig) -> Self {
        Self {
            kind: config.backend,
            slots: config.queue_slots,
            ack_policy: config.ack_policy,
            numa_aware: config.numa_aware,
        }
    }
}

impl QueueOptions {
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_kind(mut self, kind: QueueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Messages each direction can hold.
    pub fn capacity(&self) -> usize {
        self.kind.capacity(self.slots)
    }

    fn buffer_bytes(&self) -> usize {
        match self.kind {
            QueueKind::Ump => ump::buffer_bytes(self.slots),
            QueueKind::Ffq => self.slots * CACHELINE_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointStats {
    sent: AtomicU64,
    received: AtomicU64,
}

/// One side of a queue pair: transmits to `peer` and receives from it.
#[derive(Debug)]
pub struct Endpoint {
    node: NodeId,
    peer: NodeId,
    tx: TxQueue,
    rx: RxQueue,
    stats: CachePadded<EndpointStats>,
}

impl Endpoint {
    /// Node that owns this side.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Node on the other side.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Sequence number the next outgoing message will carry.
    pub fn sequence(&self) -> u64 {
        match &self.tx {
            TxQueue::Ump(q) => q.sequence() as u64,
            TxQueue::Ffq(q) => q.sequence() as u64,
        }
    }

    /// Last acknowledgement seen from the peer (UMP only).
    pub fn last_ack(&self) -> Option<u16> {
        match &self.tx {
            TxQueue::Ump(q) => Some(q.last_ack()),
            TxQueue::Ffq(_) => None,
        }
    }

    /// Messages sent since creation.
    pub fn sent(&self) -> u64 {
        self.stats.0.sent.load(Ordering::Relaxed)
    }

    /// Messages received since creation.
    pub fn received(&self) -> u64 {
        self.stats.0.received.load(Ordering::Relaxed)
    }

    pub fn tx_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn rx_capacity(&self) -> usize {
        self.rx.capacity()
    }
}

impl Channel for Endpoint {
    #[inline]
    fn try_send(&self, msg: &Message) -> CollectiveResult<()> {
        self.tx.try_send(msg)?;
        bump(&self.stats.0.sent);
        Ok(())
    }

    #[inline]
    fn try_notify(&self) -> CollectiveResult<()> {
        self.tx.try_notify()?;
        bump(&self.stats.0.sent);
        Ok(())
    }

    #[inline]
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        self.rx.try_recv(msg)?;
        bump(&self.stats.0.received);
        Ok(())
    }

    #[inline]
    fn can_send(&self) -> bool {
        self.tx.can_send()
    }

    #[inline]
    fn can_recv(&self) -> bool {
        self.rx.can_recv()
    }
}

/// Two opposite rings joining `src` and `dst`.
#[derive(Debug)]
pub struct QueuePair {
    src: Endpoint,
    dst: Endpoint,
    options: QueueOptions,
}

impl QueuePair {
    /// Default UMP pair with `slot_count` lines per direction.
    pub fn new(slot_count: usize, src: Node, dst: Node) -> CollectiveResult<Self> {
        Self::create(
            src,
            dst,
            QueueOptions::default().with_slots(slot_count),
            &SystemAllocator,
        )
    }

    /// Allocate both buffers and wire the endpoints.
    ///
    /// An allocation failure for the second buffer releases the first before
    /// the error is returned.
    pub fn create(
        src: Node,
        dst: Node,
        options: QueueOptions,
        alloc: &dyn NumaAllocator,
    ) -> CollectiveResult<Self> {
        let to_dst = Arc::new(alloc_ring(alloc, &options, dst)?);
        let to_src = Arc::new(alloc_ring(alloc, &options, src)?);

        let (src_tx, dst_rx) = build(&options, to_dst)?;
        let (dst_tx, src_rx) = build(&options, to_src)?;

        debug!(
            "queue pair {} <-> {}: {:?}, {} slots",
            src, dst, options.kind, options.slots
        );

        Ok(Self {
            src: Endpoint {
                node: src.id(),
                peer: dst.id(),
                tx: src_tx,
                rx: src_rx,
                stats: CachePadded::default(),
            },
            dst: Endpoint {
                node: dst.id(),
                peer: src.id(),
                tx: dst_tx,
                rx: dst_rx,
                stats: CachePadded::default(),
            },
            options,
        })
    }

    /// The `src` node's side.
    pub fn src(&self) -> &Endpoint {
        &self.src
    }

    /// The `dst` node's side.
    pub fn dst(&self) -> &Endpoint {
        &self.dst
    }

    /// The side owned by `node`, if it is one of the two ends.
    pub fn endpoint(&self, node: NodeId) -> Option<&Endpoint> {
        if self.src.node == node {
            Some(&self.src)
        } else if self.dst.node == node {
            Some(&self.dst)
        } else {
            None
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }
}

fn alloc_ring(
    alloc: &dyn NumaAllocator,
    options: &QueueOptions,
    consumer: Node,
) -> CollectiveResult<AlignedBuffer> {
    let bytes = options.buffer_bytes();
    if options.numa_aware {
        let numa = numa_node_of_cpu(consumer.core());
        alloc.alloc_on_node(bytes, CACHELINE_SIZE, numa)
    } else {
        alloc.alloc(bytes, CACHELINE_SIZE)
    }
}

fn build(options: &QueueOptions, buf: Arc<AlignedBuffer>) -> CollectiveResult<(TxQueue, RxQueue)> {
    let pair = match options.kind {
        QueueKind::Ump => ump_channel(buf, options.slots, options.ack_policy)
            .map(|(tx, rx)| (TxQueue::Ump(tx), RxQueue::Ump(rx))),
        QueueKind::Ffq => ffq_channel(buf, options.slots)
            .map(|(tx, rx)| (TxQueue::Ffq(tx), RxQueue::Ffq(rx))),
    };
    pair.map_err(CollectiveError::chan_create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RetryPolicy;
    use std::sync::atomic::AtomicUsize;

    /// Fails every allocation after the first `ok` ones.
    struct FlakyAllocator {
        ok: usize,
        calls: AtomicUsize,
    }

    impl NumaAllocator for FlakyAllocator {
        fn alloc(&self, bytes: usize, align: usize) -> CollectiveResult<AlignedBuffer> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok {
                return Err(CollectiveError::MallocFail { bytes });
            }
            SystemAllocator.alloc(bytes, align)
        }

        fn alloc_on_node(
            &self,
            bytes: usize,
            align: usize,
            _numa_node: usize,
        ) -> CollectiveResult<AlignedBuffer> {
            self.alloc(bytes, align)
        }
    }

    #[test]
    fn test_both_directions() {
        let qp = QueuePair::new(4, Node::new(0, 0), Node::new(1, 0)).unwrap();
        let policy = RetryPolicy::bounded(1000);
        let mut out = Message::default();

        qp.src().send(&Message::word(11), &policy).unwrap();
        qp.dst().recv(&mut out, &policy).unwrap();
        assert_eq!(out.first_word(), 11);

        qp.dst().send(&Message::word(22), &policy).unwrap();
        qp.src().recv(&mut out, &policy).unwrap();
        assert_eq!(out.first_word(), 22);

        assert_eq!(qp.src().sent(), 1);
        assert_eq!(qp.src().received(), 1);
        assert_eq!(qp.dst().peer(), 0);
        assert_eq!(qp.src().sequence(), 2);
    }

    #[test]
    fn test_admission_bounded_by_capacity() {
        let qp = QueuePair::new(3, Node::new(0, 0), Node::new(1, 0)).unwrap();
        assert_eq!(qp.src().tx_capacity(), 2);
        qp.src().try_send(&Message::word(1)).unwrap();
        qp.src().try_send(&Message::word(2)).unwrap();
        assert!(matches!(
            qp.src().try_send(&Message::word(3)),
            Err(CollectiveError::QueueFull)
        ));
        let err = qp
            .src()
            .send(&Message::word(3), &RetryPolicy::bounded(10))
            .unwrap_err();
        assert!(matches!(err, CollectiveError::Timeout(_)));
        // The reverse direction is independent
        assert!(qp.dst().can_send());
    }

    #[test]
    fn test_ffq_pair() {
        let options = QueueOptions::default().with_kind(QueueKind::Ffq).with_slots(2);
        let qp =
            QueuePair::create(Node::new(4, 0), Node::new(9, 0), options, &SystemAllocator).unwrap();
        assert_eq!(qp.src().tx_capacity(), 2);
        qp.dst().try_notify().unwrap();
        assert!(qp.src().can_recv());
        assert_eq!(qp.endpoint(9).map(|e| e.node()), Some(9));
        assert!(qp.endpoint(5).is_none());
        assert_eq!(qp.src().last_ack(), None);
    }

    #[test]
    fn test_second_allocation_failure() {
        let alloc = FlakyAllocator {
            ok: 1,
            calls: AtomicUsize::new(0),
        };
        let err = QueuePair::create(
            Node::new(0, 0),
            Node::new(1, 0),
            QueueOptions::default(),
            &alloc,
        )
        .unwrap_err();
        assert!(matches!(err, CollectiveError::MallocFail { .. }));
        assert_eq!(alloc.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bad_geometry_is_chan_create() {
        let err = QueuePair::new(1, Node::new(0, 0), Node::new(1, 0)).unwrap_err();
        assert!(matches!(err, CollectiveError::ChanCreate(_)));
        assert!(matches!(
            err.root_cause(),
            CollectiveError::InvalidArgument(_)
        ));
    }
}
