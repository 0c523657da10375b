//! Shared test utilities for horus_collective integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use horus_collective::prelude::*;

/// Budget for every blocking call in tests; a hung peer fails the test
/// instead of spinning forever.
pub const TEST_DEADLINE: Duration = Duration::from_secs(20);

/// Initialise `env_logger` once per test process.
pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Retry policy used by integration tests.
pub fn test_policy() -> RetryPolicy {
    RetryPolicy::deadline(TEST_DEADLINE).with_yield_every(64)
}

/// Test configuration: small rings, no pinning (tests may oversubscribe cores).
pub fn test_config() -> CollectiveConfig {
    CollectiveConfig {
        queue_slots: 8,
        pin_threads: false,
        ..Default::default()
    }
}

/// Context over `topology` with one node per id and the test policy.
pub fn context_for(topology: Topology) -> Context {
    let topology = Arc::new(topology);
    let nodes = Node::sequential(topology.len());
    Context::create(
        topology,
        &nodes,
        &test_config(),
        &horus_collective::platform::SystemAllocator,
    )
    .expect("context creation should succeed")
    .with_retry(test_policy())
}

/// Balanced binary-tree context over `n` nodes.
pub fn binary_context(n: usize) -> Context {
    context_for(Topology::binary_tree(n, "test-binary").expect("binary tree"))
}
