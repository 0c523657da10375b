//! Platform services: NUMA-aware allocation, core pinning, node threads.

pub mod affinity;
pub mod mem;
pub mod threads;

pub use affinity::{available_cpus, numa_node_of_cpu, pin_thread_to_core};
pub use mem::{AlignedBuffer, NumaAllocator, SystemAllocator, BASE_PAGE_SIZE, CACHELINE_SIZE};
pub use threads::{run_nodes, spawn_node, NodeHandle};
