//! Timing attack protection and constant-time operations.
//!
//! This module provides utilities to protect against timing-based side-channel attacks
//! by implementing constant-time comparisons and minimum-duration error paths.

use crate::error::Result;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

/// Minimum operation time for guarded operations (in microseconds)
pub const MIN_OPERATION_TIME_US: u64 = 1000; // 1ms minimum

/// Constant-time utilities for security-critical operations
pub struct TimingSafe;

impl TimingSafe {
    /// Constant-time comparison of byte arrays
    ///
    /// Returns true if arrays are equal, false otherwise.
    /// Takes the same amount of time regardless of input data.
    pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            // Still perform a comparison to maintain constant time
            let dummy_a = [0u8; 32];
            let dummy_b = [1u8; 32];
            let _dummy_result = dummy_a.ct_eq(&dummy_b);
            false
        } else {
            a.ct_eq(b).into()
        }
    }

    /// Performs an operation with minimum timing guarantee
    ///
    /// Ensures the operation takes at least `min_duration` to complete,
    /// padding with busy work if necessary to prevent timing analysis.
    pub fn timed_operation<F, T>(operation: F, min_duration: Duration) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = operation();
        let elapsed = start.elapsed();

        if elapsed < min_duration {
            Self::busy_wait(min_duration - elapsed);
        }

        result
    }

    /// Busy wait that performs meaningless operations
    fn busy_wait(duration: Duration) {
        let start = Instant::now();
        let mut dummy: u64 = 1;

        while start.elapsed() < duration {
            dummy = dummy.wrapping_mul(1103515245).wrapping_add(12345);
            dummy ^= dummy >> 16;
            dummy = dummy.wrapping_mul(2654435761);
        }

        std::hint::black_box(dummy);
    }
}

/// Timing-safe error handling that prevents information leakage
pub struct TimingSafeError;

impl TimingSafeError {
    /// Runs a fallible operation so that success and failure share the same minimum duration
    pub fn validate_with_timing<T, F>(validation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        TimingSafe::timed_operation(validation, Duration::from_micros(MIN_OPERATION_TIME_US))
    }
}
