//! # Turnstile Testing
//!
//! Testing utilities for Turnstile reducers and services.
//!
//! This crate provides:
//! - Deterministic implementations of the environment traits (clock, randomness)
//! - A Given-When-Then harness for reducers
//! - Assertion helpers for effects
//!
//! ## Example
//!
//! ```ignore
//! use turnstile_testing::{ManualClock, SeededRandom};
//!
//! #[tokio::test]
//! async fn reservation_expires() {
//!     let clock = Arc::new(ManualClock::new(test_time()));
//!     let lifecycle = TicketLifecycle::new(config, clock.clone(), Arc::new(SeededRandom::new(7)));
//!
//!     clock.advance(chrono::Duration::minutes(10));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use turnstile_core::environment::{Clock, RandomSource};

pub mod reducer_test;

/// Mock implementations of environment traits
pub mod mocks {
    use super::{Clock, DateTime, RandomSource, Utc};
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use turnstile_testing::mocks::FixedClock;
    /// use turnstile_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test tells it to
    ///
    /// Shared behind an `Arc` so a test can advance time that a service
    /// under test is reading.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward (or backward, for negative durations)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Deterministic randomness for reproducible identifiers
    ///
    /// Never use outside tests: the output is predictable from the seed.
    #[derive(Debug)]
    pub struct SeededRandom {
        rng: Mutex<StdRng>,
    }

    impl SeededRandom {
        /// Create a generator from a fixed seed
        #[must_use]
        pub fn new(seed: u64) -> Self {
            Self {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }
        }
    }

    impl RandomSource for SeededRandom {
        fn fill_bytes(&self, dest: &mut [u8]) {
            self.rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fill_bytes(dest);
        }
    }

    /// Fixed reference instant used across tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests, pinned at [`test_time`]
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, SeededRandom, test_clock, test_time};
pub use reducer_test::{ReducerTest, assertions};
