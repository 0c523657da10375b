//! Internal utility functions for HORUS collectives
//!
//! Shared helpers used across multiple modules.

// ============================================================================
// Branch Prediction Hints (HOT PATH OPTIMIZATION)
// ============================================================================

/// Hint that a branch is unlikely to be taken (cold path)
#[inline(always)]
#[cold]
fn cold() {}

/// Mark a condition as unlikely (branch prediction hint for cold paths).
/// Use for: queue-full and queue-empty checks.
#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}

/// Mark a condition as likely (branch prediction hint for hot paths).
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

// ============================================================================
// Serde defaults
// ============================================================================

/// Serde default helper for boolean flags that are on unless disabled.
pub(crate) fn default_true() -> bool {
    true
}

// ============================================================================
// Integer helpers
// ============================================================================

/// `ceil(log2(n))`, with 0 for `n <= 1`.
pub(crate) fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(ceil_log2(17), 5);
    }

    #[test]
    fn test_hints_are_transparent() {
        assert!(likely(true));
        assert!(!likely(false));
        assert!(unlikely(true));
        assert!(!unlikely(false));
    }
}
