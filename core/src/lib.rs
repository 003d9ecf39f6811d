//! # Turnstile Core
//!
//! Core traits and types for the Turnstile ticketing core.
//!
//! Business rules are written as reducers: pure functions
//! `(State, Action, Environment) → (State, Effects)` whose side effects are
//! returned as descriptions and executed later by the runtime `Store`.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state for one aggregate instance (an event's capacity, a ticket)
//! - **Action**: All inputs to a reducer (commands and the events they produce)
//! - **Reducer**: Pure function that validates, mutates state and describes effects
//! - **Effect**: Side effect descriptions (notifications, delayed actions)
//! - **Environment**: Injected dependencies (clock, randomness, collaborators)
//!
//! ## Example
//!
//! ```ignore
//! use turnstile_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! impl Reducer for CapacityReducer {
//!     type State = CapacityState;
//!     type Action = CapacityAction;
//!     type Environment = CapacityEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut CapacityState,
//!         action: CapacityAction,
//!         env: &CapacityEnvironment,
//!     ) -> SmallVec<[Effect<CapacityAction>; 4]> {
//!         // Business logic goes here
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Declarative macros for building effects
pub mod effect_macros;

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They hold every business rule and are deterministic for a fixed environment.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action against the current state
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// Most reducers return zero to four effects, so the result is a
        /// `SmallVec` that stays on the stack in the common case.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution); the runtime executes them only after the
/// reducer has returned and the state lock has been released.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (for timeouts, retries)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Whether this effect does nothing when executed
        #[must_use]
        pub fn is_none(&self) -> bool {
            match self {
                Effect::None => true,
                Effect::Parallel(effects) | Effect::Sequential(effects) => {
                    effects.iter().all(Effect::is_none)
                },
                Effect::Delay { .. } | Effect::Future(_) => false,
            }
        }
    }
}

/// Environment module - Dependency injection traits
///
/// Time and randomness are the two leaves every other component depends on.
/// Both are injected so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};
    use rand::RngCore;

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of cryptographically secure random bytes
    ///
    /// Identifiers that must be unguessable (ticket ids) are drawn from here.
    pub trait RandomSource: Send + Sync {
        /// Fill `dest` with random bytes
        fn fill_bytes(&self, dest: &mut [u8]);
    }

    /// Production randomness backed by the operating system CSPRNG
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OsRandom;

    impl RandomSource for OsRandom {
        fn fill_bytes(&self, dest: &mut [u8]) {
            rand::rngs::OsRng.fill_bytes(dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::environment::{Clock, OsRandom, RandomSource, SystemClock};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    enum TestAction {
        Ping,
    }

    #[test]
    fn nested_none_effects_are_none() {
        let effect: Effect<TestAction> =
            Effect::merge(vec![Effect::None, Effect::chain(vec![Effect::None])]);
        assert!(effect.is_none());

        let delayed = Effect::Delay {
            duration: Duration::from_millis(1),
            action: Box::new(TestAction::Ping),
        };
        assert!(!Effect::merge(vec![Effect::None, delayed]).is_none());
    }

    #[test]
    fn debug_hides_future_contents() {
        let effect: Effect<TestAction> = Effect::Future(Box::pin(async { None }));
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn os_random_fills_buffer() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        OsRandom.fill_bytes(&mut a);
        OsRandom.fill_bytes(&mut b);
        assert_ne!(a, b);
    }
}
