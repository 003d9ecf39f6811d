//! Capacity ledger.
//!
//! One [`CapacityState`] per event holds the confirmed-sold count and the
//! quantities held by open reservations. Every reserve, confirm, release and
//! refund for an event is reduced by that event's store, one at a time, so the
//! availability check and the increment happen under the same lock:
//!
//! ```text
//! remaining = capacity - confirmed_sold - Σ pending
//!
//! if quantity > remaining {
//!     return CapacityExceeded   // one racer wins, the rest fail cleanly
//! }
//! ```
//!
//! Events for different keys never contend.

use crate::error::{Result, TicketingError};
use crate::types::{EventId, ReservationId};
use serde::Serialize;
use std::collections::HashMap;
use turnstile_core::{SmallVec, effect::Effect, reducer::Reducer};
use turnstile_runtime::KeyedStores;

// ============================================================================
// State
// ============================================================================

/// Capacity accounting for one event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapacityState {
    /// Total sellable tickets
    pub capacity: u32,
    /// Tickets whose payment is confirmed
    pub confirmed_sold: u32,
    /// Quantities held by open reservations
    pub pending: HashMap<ReservationId, u32>,
    /// Outcome of the last command (`None` on success)
    pub last_error: Option<TicketingError>,
}

impl CapacityState {
    /// Ledger for an event with `confirmed_sold` tickets already sold
    #[must_use]
    pub fn new(capacity: u32, confirmed_sold: u32) -> Self {
        Self {
            capacity,
            confirmed_sold,
            pending: HashMap::new(),
            last_error: None,
        }
    }

    /// Tickets held by open reservations
    #[must_use]
    pub fn pending_total(&self) -> u32 {
        self.pending.values().sum()
    }

    /// Tickets still available for new reservations
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.capacity
            .saturating_sub(self.confirmed_sold)
            .saturating_sub(self.pending_total())
    }

    /// Read-only copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            capacity: self.capacity,
            confirmed_sold: self.confirmed_sold,
            pending: self.pending_total(),
        }
    }
}

/// Counters of one event at a point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    /// Total sellable tickets
    pub capacity: u32,
    /// Tickets whose payment is confirmed
    pub confirmed_sold: u32,
    /// Tickets held by open reservations
    pub pending: u32,
}

impl CapacitySnapshot {
    /// `capacity - confirmed_sold - pending`
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.capacity
            .saturating_sub(self.confirmed_sold)
            .saturating_sub(self.pending)
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the capacity ledger
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapacityAction {
    // Commands
    /// Hold `quantity` tickets for a reservation
    Reserve {
        /// Reservation taking the hold
        reservation_id: ReservationId,
        /// Tickets to hold
        quantity: u32,
    },

    /// Turn a reservation's hold into sold tickets
    Confirm {
        /// Reservation being paid
        reservation_id: ReservationId,
    },

    /// Drop a reservation's hold
    Release {
        /// Reservation being released
        reservation_id: ReservationId,
    },

    /// Return sold tickets to sale
    Refund {
        /// Tickets refunded
        quantity: u32,
    },

    // Events
    /// Hold placed
    Reserved {
        /// Reservation
        reservation_id: ReservationId,
        /// Tickets held
        quantity: u32,
    },

    /// Hold converted into sales
    Confirmed {
        /// Reservation
        reservation_id: ReservationId,
        /// Tickets sold
        quantity: u32,
    },

    /// Hold dropped
    Released {
        /// Reservation
        reservation_id: ReservationId,
        /// Tickets returned
        quantity: u32,
    },

    /// Sales returned
    Refunded {
        /// Tickets returned
        quantity: u32,
    },

    /// Command rejected
    Rejected {
        /// Why
        error: TicketingError,
    },
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the capacity ledger
#[derive(Clone, Debug, Default)]
pub struct CapacityReducer;

impl CapacityReducer {
    /// Creates a new `CapacityReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate_reserve(
        state: &CapacityState,
        reservation_id: &ReservationId,
        quantity: u32,
    ) -> Result<()> {
        if state.pending.contains_key(reservation_id) {
            return Err(TicketingError::InvalidStateTransition {
                state: "held",
                attempted: "reserve",
            });
        }

        // Check against both sold and held tickets
        let remaining = state.remaining();
        if quantity > remaining {
            return Err(TicketingError::CapacityExceeded {
                requested: quantity,
                remaining,
            });
        }

        Ok(())
    }

    fn apply_event(state: &mut CapacityState, action: &CapacityAction) {
        match action {
            CapacityAction::Reserved {
                reservation_id,
                quantity,
            } => {
                state.pending.insert(*reservation_id, *quantity);
                state.last_error = None;
            },
            CapacityAction::Confirmed {
                reservation_id,
                quantity,
            } => {
                state.pending.remove(reservation_id);
                state.confirmed_sold += quantity;
                state.last_error = None;
            },
            CapacityAction::Released { reservation_id, .. } => {
                state.pending.remove(reservation_id);
                state.last_error = None;
            },
            CapacityAction::Refunded { quantity } => {
                state.confirmed_sold -= quantity;
                state.last_error = None;
            },
            CapacityAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            // Commands don't modify state
            CapacityAction::Reserve { .. }
            | CapacityAction::Confirm { .. }
            | CapacityAction::Release { .. }
            | CapacityAction::Refund { .. } => {},
        }
    }

    fn decide(state: &CapacityState, action: CapacityAction) -> CapacityAction {
        match action {
            CapacityAction::Reserve {
                reservation_id,
                quantity,
            } => match Self::validate_reserve(state, &reservation_id, quantity) {
                Ok(()) => CapacityAction::Reserved {
                    reservation_id,
                    quantity,
                },
                Err(error) => CapacityAction::Rejected { error },
            },

            CapacityAction::Confirm { reservation_id } => match state.pending.get(&reservation_id) {
                Some(&quantity) => CapacityAction::Confirmed {
                    reservation_id,
                    quantity,
                },
                None => CapacityAction::Rejected {
                    error: TicketingError::InvalidStateTransition {
                        state: "not held",
                        attempted: "confirm",
                    },
                },
            },

            // Releasing an unknown hold is a no-op so retries are harmless
            CapacityAction::Release { reservation_id } => CapacityAction::Released {
                reservation_id,
                quantity: state.pending.get(&reservation_id).copied().unwrap_or(0),
            },

            CapacityAction::Refund { quantity } => {
                if quantity > state.confirmed_sold {
                    CapacityAction::Rejected {
                        error: TicketingError::InvalidStateTransition {
                            state: "not sold",
                            attempted: "refund",
                        },
                    }
                } else {
                    CapacityAction::Refunded { quantity }
                }
            },

            // Events are applied as given
            event => event,
        }
    }
}

impl Reducer for CapacityReducer {
    type State = CapacityState;
    type Action = CapacityAction;
    type Environment = ();

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        _env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let event = Self::decide(state, action);
        Self::apply_event(state, &event);
        SmallVec::new()
    }
}

// ============================================================================
// Ledger
// ============================================================================

type CapacityStores = KeyedStores<EventId, CapacityState, CapacityAction, (), CapacityReducer>;

/// Per-event capacity accounting with one serialization point per event
pub struct CapacityLedger {
    stores: CapacityStores,
}

impl Default for CapacityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityLedger {
    /// Creates an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: KeyedStores::new(CapacityReducer::new(), ()),
        }
    }

    /// Start tracking an event
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventAlreadyRegistered`] if the event is
    /// already tracked.
    pub fn open(&self, event_id: EventId, capacity: u32, confirmed_sold: u32) -> Result<()> {
        self.stores
            .insert(event_id, CapacityState::new(capacity, confirmed_sold))
            .map(|_| ())
            .ok_or(TicketingError::EventAlreadyRegistered(event_id))
    }

    /// Hold `quantity` tickets; all or nothing
    ///
    /// Returns the counters as they stood when the hold was placed.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::CapacityExceeded`] if fewer than `quantity`
    /// tickets remain; nothing is held in that case.
    pub async fn reserve(
        &self,
        event_id: EventId,
        reservation_id: ReservationId,
        quantity: u32,
    ) -> Result<CapacitySnapshot> {
        self.dispatch(
            event_id,
            CapacityAction::Reserve {
                reservation_id,
                quantity,
            },
        )
        .await
    }

    /// Convert a hold into sold tickets
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidStateTransition`] if the reservation
    /// holds nothing.
    pub async fn confirm(&self, event_id: EventId, reservation_id: ReservationId) -> Result<()> {
        self.dispatch(event_id, CapacityAction::Confirm { reservation_id })
            .await
            .map(|_| ())
    }

    /// Drop a hold; releasing twice is harmless
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventNotFound`] for unknown events.
    pub async fn release(&self, event_id: EventId, reservation_id: ReservationId) -> Result<()> {
        self.dispatch(event_id, CapacityAction::Release { reservation_id })
            .await
            .map(|_| ())
    }

    /// Return sold tickets to sale
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidStateTransition`] if more tickets are
    /// refunded than were sold.
    pub async fn refund(&self, event_id: EventId, quantity: u32) -> Result<()> {
        self.dispatch(event_id, CapacityAction::Refund { quantity })
            .await
            .map(|_| ())
    }

    /// `capacity - confirmed_sold - pending`, for display
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventNotFound`] for unknown events.
    pub async fn remaining_capacity(&self, event_id: EventId) -> Result<u32> {
        Ok(self.snapshot(event_id).await?.remaining())
    }

    /// Current counters
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventNotFound`] for unknown events.
    pub async fn snapshot(&self, event_id: EventId) -> Result<CapacitySnapshot> {
        let store = self
            .stores
            .get(&event_id)
            .ok_or(TicketingError::EventNotFound(event_id))?;
        Ok(store.state(CapacityState::snapshot).await)
    }

    async fn dispatch(&self, event_id: EventId, action: CapacityAction) -> Result<CapacitySnapshot> {
        let store = self
            .stores
            .get(&event_id)
            .ok_or(TicketingError::EventNotFound(event_id))?;
        let (error, snapshot) = store
            .send_and_inspect(action, |state| (state.last_error.clone(), state.snapshot()))
            .await?;
        error.map_or(Ok(snapshot), Err)
    }
}
