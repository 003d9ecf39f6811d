//! Ergonomic testing utilities for reducers
//!
//! Reducer tests read as Given-When-Then: a starting state, one action, and
//! assertions on the state and effects it produced.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use turnstile_core::{effect::Effect, reducer::Reducer};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use turnstile_testing::ReducerTest;
///
/// ReducerTest::new(CapacityReducer::new())
///     .with_env(CapacityEnvironment::default())
///     .given_state(CapacityState::new(10, 0))
///     .when_action(CapacityAction::Reserve { reservation_id, quantity: 2 })
///     .then_state(|state| assert_eq!(state.pending_total(), 2))
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    actions: Vec<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            actions: Vec::new(),
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add an action to apply (When)
    ///
    /// Several actions run in order; effect assertions see the effects of
    /// the last one only.
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the resulting effects (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, actions, or environment is not set,
    /// or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");
        assert!(
            !self.actions.is_empty(),
            "At least one action must be set with when_action()"
        );

        let mut effects = Vec::new();
        for action in self.actions {
            effects = self.reducer.reduce(&mut state, action, &env).into_vec();
        }

        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    use turnstile_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if any effect would do something when executed.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().all(Effect::is_none),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Future(_))),
            "Expected at least one Future effect, but none found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::{SmallVec, effect::Effect, reducer::Reducer, smallvec};

    #[derive(Clone, Debug)]
    struct TurnstileState {
        entries: u32,
    }

    #[derive(Clone, Debug)]
    enum TurnstileAction {
        Admit,
        AdmitAndAnnounce,
    }

    struct TurnstileReducer;

    struct TestEnv;

    impl Reducer for TurnstileReducer {
        type State = TurnstileState;
        type Action = TurnstileAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]> {
            state.entries += 1;
            match action {
                TurnstileAction::Admit => smallvec![Effect::None],
                TurnstileAction::AdmitAndAnnounce => {
                    smallvec![Effect::Future(Box::pin(async { None }))]
                },
            }
        }
    }

    #[test]
    fn test_single_action() {
        ReducerTest::new(TurnstileReducer)
            .with_env(TestEnv)
            .given_state(TurnstileState { entries: 0 })
            .when_action(TurnstileAction::Admit)
            .then_state(|state| assert_eq!(state.entries, 1))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_action_sequence_reports_last_effects() {
        ReducerTest::new(TurnstileReducer)
            .with_env(TestEnv)
            .given_state(TurnstileState { entries: 3 })
            .when_action(TurnstileAction::Admit)
            .when_action(TurnstileAction::AdmitAndAnnounce)
            .then_state(|state| assert_eq!(state.entries, 5))
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }
}
