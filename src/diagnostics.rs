//! Lightweight outstanding-object accounting.
//!
//! Rust's ownership model makes an explicit allocator parameter (as the
//! C original threads through every constructor) redundant for memory
//! safety, but the leak-shaped testable property it was used for —
//! "after init, use, and clean-up, nothing is left outstanding" — is
//! still a useful invariant to assert in tests. This module tracks the
//! count of live [`crate::connection::ConnectionInner`] and
//! [`crate::client::ClientBootstrapRecord`] instances instead of bytes.

use std::sync::atomic::{AtomicIsize, Ordering};

static OUTSTANDING: AtomicIsize = AtomicIsize::new(0);

pub(crate) struct Guard;

impl Guard {
    pub(crate) fn acquire() -> Self {
        OUTSTANDING.fetch_add(1, Ordering::Relaxed);
        Self
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        OUTSTANDING.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Number of tracked objects currently live.
///
/// Used by tests and by callers who want the same leak-detection shape
/// the C original got for free from its tracing allocator.
pub fn outstanding() -> isize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// Resets the counter to zero.
///
/// Called by [`crate::library_init`]. Not meant to be called while
/// other instances are live except in test set-up that intentionally
/// wants a fresh baseline.
pub fn reset() {
    OUTSTANDING.store(0, Ordering::SeqCst);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn guard_increments_and_decrements() {
        reset();
        assert_eq!(outstanding(), 0);
        let g = Guard::acquire();
        assert_eq!(outstanding(), 1);
        drop(g);
        assert_eq!(outstanding(), 0);
    }
}
