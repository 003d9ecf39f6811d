//! # Turnstile Runtime
//!
//! Runtime implementation for Turnstile reducers.
//!
//! This crate provides the [`Store`] runtime that coordinates reducer execution
//! and effect handling, and [`KeyedStores`], a registry holding one store per
//! aggregate key.
//!
//! ## Serialization guarantee
//!
//! A store owns exactly one aggregate instance. Every action sent to it is
//! reduced while holding the store's write lock, so two actions on the same
//! instance never interleave. Effects returned by the reducer are spawned only
//! after the lock has been released; nothing slow (network I/O, notifications)
//! ever runs inside the critical section.
//!
//! ## Example
//!
//! ```ignore
//! use turnstile_runtime::Store;
//!
//! let store = Store::new(CapacityState::new(100, 0), CapacityReducer::new(), env);
//!
//! // Reduce and observe the outcome under the same lock
//! let outcome = store
//!     .send_and_inspect(CapacityAction::Reserve { .. }, |s| s.last_error.clone())
//!     .await?;
//!
//! // Read state
//! let remaining = store.state(CapacityState::remaining).await;
//! ```

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use turnstile_core::{effect::Effect, reducer::Reducer};

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        ///
        /// This error is returned when `send()` is called after shutdown initiated.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Timed out waiting for spawned effects to complete
        #[error("Timed out with {0} effects still running")]
        EffectsTimeout(usize),
    }
}

pub use error::StoreError;

/// Decrements the pending-effect counter when a spawned effect finishes,
/// including when its task panics.
struct PendingEffectGuard(Arc<AtomicUsize>);

impl Drop for PendingEffectGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The Store - runtime for one reducer-managed aggregate instance
///
/// Cloning a store is cheap and yields a handle to the same state.
///
/// # Type Parameters
///
/// - `S`: State type
/// - `A`: Action type
/// - `E`: Environment type
/// - `R`: Reducer implementation
pub struct Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    state: Arc<RwLock<S>>,
    reducer: Arc<R>,
    environment: Arc<E>,
    shutdown: Arc<AtomicBool>,
    pending_effects: Arc<AtomicUsize>,
}

impl<S, A, E, R> Clone for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            reducer: Arc::clone(&self.reducer),
            environment: Arc::clone(&self.environment),
            shutdown: Arc::clone(&self.shutdown),
            pending_effects: Arc::clone(&self.pending_effects),
        }
    }
}

impl<S, A, E, R> Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Send + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a new store with initial state, reducer, and environment
    #[must_use]
    pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
        Self::with_shared(initial_state, Arc::new(reducer), Arc::new(environment))
    }

    /// Create a new store that shares its reducer and environment with others
    ///
    /// Registries create one store per key; sharing avoids cloning the
    /// environment for every instance.
    #[must_use]
    pub fn with_shared(initial_state: S, reducer: Arc<R>, environment: Arc<E>) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial_state)),
            reducer,
            environment,
            shutdown: Arc::new(AtomicBool::new(false)),
            pending_effects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Send an action to the store
    ///
    /// 1. Acquires write lock on state
    /// 2. Calls reducer with (state, action, environment)
    /// 3. Releases the lock and spawns the returned effects
    ///
    /// Returns after effects have been started, not completed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    pub async fn send(&self, action: A) -> Result<(), StoreError> {
        self.send_and_inspect(action, |_| ()).await
    }

    /// Send an action and read the resulting state under the same write lock
    ///
    /// No other action can be reduced between the reducer call and `inspect`,
    /// so the caller observes exactly the outcome of its own action. This is
    /// how request handlers turn a reducer decision into a typed result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    #[tracing::instrument(skip_all, name = "store_send")]
    pub async fn send_and_inspect<F, T>(&self, action: A, inspect: F) -> Result<T, StoreError>
    where
        F: FnOnce(&S) -> T,
    {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Rejected action: store is shutting down");
            metrics::counter!("store.shutdown.rejected_actions").increment(1);
            return Err(StoreError::ShutdownInProgress);
        }

        metrics::counter!("store.actions.total").increment(1);

        let (effects, observed) = {
            let mut state = self.state.write().await;

            let start = std::time::Instant::now();
            let effects = self.reducer.reduce(&mut *state, action, &self.environment);
            metrics::histogram!("store.reducer.duration_seconds")
                .record(start.elapsed().as_secs_f64());

            let observed = inspect(&*state);
            (effects, observed)
        };

        tracing::trace!("Reducer completed, executing {} effects", effects.len());
        for effect in effects {
            self.execute_effect(effect);
        }

        Ok(observed)
    }

    /// Read current state via a closure
    ///
    /// ```ignore
    /// let remaining = store.state(CapacityState::remaining).await;
    /// ```
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        let state = self.state.read().await;
        f(&*state)
    }

    /// Number of spawned effects that have not finished yet
    #[must_use]
    pub fn pending_effects(&self) -> usize {
        self.pending_effects.load(Ordering::Acquire)
    }

    /// Wait until every spawned effect (and the actions they fed back) finished
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EffectsTimeout`] if effects are still running
    /// when `timeout` elapses.
    pub async fn settle(&self, timeout: Duration) -> Result<(), StoreError> {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(5);

        loop {
            let pending = self.pending_effects();
            if pending == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(StoreError::EffectsTimeout(pending));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop accepting actions and wait for in-flight effects
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EffectsTimeout`] if effects are still running
    /// when `timeout` elapses.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown.store(true, Ordering::Release);

        let result = self.settle(timeout).await;
        if let Err(StoreError::EffectsTimeout(pending)) = &result {
            tracing::error!(pending_effects = pending, "Shutdown timed out");
        }
        result
    }

    /// Spawn an effect outside of the state lock
    fn execute_effect(&self, effect: Effect<A>) {
        match effect {
            Effect::None => {
                metrics::counter!("store.effects.executed", "type" => "none").increment(1);
            },
            Effect::Parallel(effects) => {
                metrics::counter!("store.effects.executed", "type" => "parallel").increment(1);
                for effect in effects {
                    self.execute_effect(effect);
                }
            },
            effect => {
                self.pending_effects.fetch_add(1, Ordering::SeqCst);
                let guard = PendingEffectGuard(Arc::clone(&self.pending_effects));
                let store = self.clone();

                tokio::spawn(async move {
                    let _guard = guard;
                    store.run_effect(effect).await;
                });
            },
        }
    }

    /// Run an effect to completion, feeding produced actions back into the store
    fn run_effect(&self, effect: Effect<A>) -> BoxFuture<'static, ()> {
        let store = self.clone();
        Box::pin(async move {
            match effect {
                Effect::None => {},
                Effect::Future(fut) => {
                    metrics::counter!("store.effects.executed", "type" => "future").increment(1);
                    if let Some(action) = fut.await {
                        store.feed_back(action).await;
                    }
                },
                Effect::Delay { duration, action } => {
                    metrics::counter!("store.effects.executed", "type" => "delay").increment(1);
                    tokio::time::sleep(duration).await;
                    store.feed_back(*action).await;
                },
                Effect::Parallel(effects) => {
                    futures::future::join_all(effects.into_iter().map(|e| store.run_effect(e)))
                        .await;
                },
                Effect::Sequential(effects) => {
                    metrics::counter!("store.effects.executed", "type" => "sequential")
                        .increment(1);
                    for effect in effects {
                        store.run_effect(effect).await;
                    }
                },
            }
        })
    }

    async fn feed_back(&self, action: A) {
        if let Err(error) = self.send(action).await {
            tracing::warn!(%error, "Dropped action produced by effect");
        }
    }
}

/// Registry holding one [`Store`] per key
///
/// Each key gets its own lock, so actions on different keys never contend.
/// The registry's own map lock is only held for lookups and inserts.
pub struct KeyedStores<K, S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: Arc<R>,
    environment: Arc<E>,
    stores: std::sync::RwLock<HashMap<K, Store<S, A, E, R>>>,
}

impl<K, S, A, E, R> KeyedStores<K, S, A, E, R>
where
    K: Eq + Hash + Clone,
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Send + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create an empty registry whose stores share `reducer` and `environment`
    #[must_use]
    pub fn new(reducer: R, environment: E) -> Self {
        Self {
            reducer: Arc::new(reducer),
            environment: Arc::new(environment),
            stores: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Look up the store for `key`
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Store<S, A, E, R>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Create a store for `key` with `initial_state`
    ///
    /// Returns `None` if a store already exists for the key; the existing
    /// instance is left untouched.
    pub fn insert(&self, key: K, initial_state: S) -> Option<Store<S, A, E, R>> {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        if stores.contains_key(&key) {
            return None;
        }
        let store = Store::with_shared(
            initial_state,
            Arc::clone(&self.reducer),
            Arc::clone(&self.environment),
        );
        stores.insert(key, store.clone());
        Some(store)
    }

    /// Drop the store for `key`
    ///
    /// Handles already obtained through [`Self::get`] keep working; later
    /// lookups return `None`.
    pub fn remove(&self, key: &K) -> Option<Store<S, A, E, R>> {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Number of registered stores
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for effects of every registered store to finish
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError::EffectsTimeout`] encountered.
    pub async fn settle(&self, timeout: Duration) -> Result<(), StoreError> {
        let stores: Vec<_> = self
            .stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for store in stores {
            store.settle(timeout).await?;
        }
        Ok(())
    }
}
