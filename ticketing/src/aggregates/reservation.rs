//! Reservation aggregate.
//!
//! A reservation holds capacity and a locked-in amount between checkout and
//! payment. Its status is the single decision point for the race between a
//! late payment confirmation and the expiry sweep: whichever action its store
//! reduces first moves it out of `Open`, and the other observes
//! `InvalidStateTransition`.
//!
//! ```text
//! Open ──Confirm──> Confirmed
//!   │
//!   └───Expire───> Expired
//! ```

use crate::error::{Result, TicketingError};
use crate::types::{ExpiryReason, Money, Reservation, ReservationStatus, TicketId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use turnstile_core::{SmallVec, effect::Effect, environment::Clock, reducer::Reducer};

// ============================================================================
// State
// ============================================================================

/// State of one reservation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationState {
    /// The reservation
    pub reservation: Reservation,
    /// Outcome of the last command (`None` on success)
    pub last_error: Option<TicketingError>,
}

impl ReservationState {
    /// Wrap a freshly created reservation
    #[must_use]
    pub const fn new(reservation: Reservation) -> Self {
        Self {
            reservation,
            last_error: None,
        }
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the reservation aggregate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationAction {
    // Commands
    /// Payment was reported for this reservation
    Confirm {
        /// Tickets the payment claims to cover
        ticket_ids: Vec<TicketId>,
        /// Amount the gateway reports as paid
        paid_amount: Money,
        /// External payment reference
        payment_reference: String,
    },

    /// Release without payment
    Expire {
        /// Why
        reason: ExpiryReason,
    },

    // Events
    /// Payment accepted
    Confirmed {
        /// External payment reference
        payment_reference: String,
        /// When
        confirmed_at: DateTime<Utc>,
    },

    /// Reservation released
    Expired {
        /// Why
        reason: ExpiryReason,
        /// When
        expired_at: DateTime<Utc>,
    },

    /// Command rejected
    Rejected {
        /// Why
        error: TicketingError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the reservation aggregate
#[derive(Clone)]
pub struct ReservationEnvironment {
    /// Clock for deadline checks and timestamps
    pub clock: Arc<dyn Clock>,
}

impl ReservationEnvironment {
    /// Creates a new `ReservationEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the reservation aggregate
#[derive(Clone, Debug, Default)]
pub struct ReservationReducer;

impl ReservationReducer {
    /// Creates a new `ReservationReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates `Confirm`
    ///
    /// A payment past the deadline is refused even if the sweep has not
    /// expired the reservation yet.
    fn validate_confirm(
        reservation: &Reservation,
        ticket_ids: &[TicketId],
        paid_amount: Money,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if reservation.status != ReservationStatus::Open {
            return Err(TicketingError::InvalidStateTransition {
                state: reservation.status.as_str(),
                attempted: "confirm",
            });
        }

        if reservation.is_past_deadline(now) {
            return Err(TicketingError::InvalidStateTransition {
                state: "past deadline",
                attempted: "confirm",
            });
        }

        // The payment must cover exactly the tickets of this reservation
        let mut claimed = ticket_ids.to_vec();
        let mut held = reservation.ticket_ids.clone();
        claimed.sort_unstable();
        held.sort_unstable();
        if claimed != held || paid_amount != reservation.amount {
            return Err(TicketingError::AmountMismatch);
        }

        Ok(())
    }

    fn apply_event(state: &mut ReservationState, action: &ReservationAction) {
        match action {
            ReservationAction::Confirmed {
                payment_reference, ..
            } => {
                state.reservation.status = ReservationStatus::Confirmed;
                state.reservation.payment_reference = Some(payment_reference.clone());
                state.last_error = None;
            },
            ReservationAction::Expired { reason, .. } => {
                state.reservation.status = ReservationStatus::Expired;
                state.reservation.expiry_reason = Some(*reason);
                state.last_error = None;
            },
            ReservationAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            // Commands don't modify state
            ReservationAction::Confirm { .. } | ReservationAction::Expire { .. } => {},
        }
    }
}

impl Reducer for ReservationReducer {
    type State = ReservationState;
    type Action = ReservationAction;
    type Environment = ReservationEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let now = env.clock.now();

        let event = match action {
            ReservationAction::Confirm {
                ticket_ids,
                paid_amount,
                payment_reference,
            } => match Self::validate_confirm(&state.reservation, &ticket_ids, paid_amount, now) {
                Ok(()) => ReservationAction::Confirmed {
                    payment_reference,
                    confirmed_at: now,
                },
                Err(error) => ReservationAction::Rejected { error },
            },

            ReservationAction::Expire { reason } => {
                if state.reservation.status == ReservationStatus::Open {
                    ReservationAction::Expired {
                        reason,
                        expired_at: now,
                    }
                } else {
                    ReservationAction::Rejected {
                        error: TicketingError::InvalidStateTransition {
                            state: state.reservation.status.as_str(),
                            attempted: "expire",
                        },
                    }
                }
            },

            // Events are applied as given
            event => event,
        };

        Self::apply_event(state, &event);
        SmallVec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, ReservationId};
    use chrono::Duration;
    use turnstile_testing::{FixedClock, ReducerTest, SeededRandom, test_time};

    fn env_at(now: DateTime<Utc>) -> ReservationEnvironment {
        ReservationEnvironment::new(Arc::new(FixedClock::new(now)))
    }

    fn open_reservation(ticket_ids: Vec<TicketId>) -> ReservationState {
        ReservationState::new(Reservation {
            id: ReservationId::new(),
            event_id: EventId::new(),
            ticket_ids,
            amount: Money::from_minor_units(22_000),
            expires_at: test_time() + Duration::minutes(5),
            status: ReservationStatus::Open,
            payment_reference: None,
            expiry_reason: None,
        })
    }

    fn tickets() -> Vec<TicketId> {
        let random = SeededRandom::new(9);
        vec![TicketId::generate(&random), TicketId::generate(&random)]
    }

    #[test]
    fn test_confirm_with_exact_amount() {
        let ids = tickets();
        let mut reversed = ids.clone();
        reversed.reverse();

        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time()))
            .given_state(open_reservation(ids))
            .when_action(ReservationAction::Confirm {
                ticket_ids: reversed,
                paid_amount: Money::from_minor_units(22_000),
                payment_reference: "order-1".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.last_error, None);
                assert_eq!(state.reservation.status, ReservationStatus::Confirmed);
                assert_eq!(state.reservation.payment_reference.as_deref(), Some("order-1"));
            })
            .run();
    }

    #[test]
    fn test_amount_mismatch_leaves_reservation_open() {
        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time()))
            .given_state(open_reservation(tickets()))
            .when_action(ReservationAction::Confirm {
                ticket_ids: tickets(),
                paid_amount: Money::from_minor_units(21_999),
                payment_reference: "order-1".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.last_error, Some(TicketingError::AmountMismatch));
                assert_eq!(state.reservation.status, ReservationStatus::Open);
            })
            .run();
    }

    #[test]
    fn test_partial_ticket_set_is_rejected() {
        let ids = tickets();
        let partial = vec![ids[0]];

        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time()))
            .given_state(open_reservation(ids))
            .when_action(ReservationAction::Confirm {
                ticket_ids: partial,
                paid_amount: Money::from_minor_units(22_000),
                payment_reference: "order-1".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.last_error, Some(TicketingError::AmountMismatch));
                assert_eq!(state.reservation.status, ReservationStatus::Open);
            })
            .run();
    }

    #[test]
    fn test_confirm_at_deadline_is_refused() {
        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time() + Duration::minutes(5)))
            .given_state(open_reservation(tickets()))
            .when_action(ReservationAction::Confirm {
                ticket_ids: tickets(),
                paid_amount: Money::from_minor_units(22_000),
                payment_reference: "order-1".to_string(),
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(TicketingError::InvalidStateTransition { attempted: "confirm", .. })
                ));
                assert_eq!(state.reservation.status, ReservationStatus::Open);
            })
            .run();
    }

    #[test]
    fn test_expired_reservation_cannot_be_confirmed() {
        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time()))
            .given_state(open_reservation(tickets()))
            .when_action(ReservationAction::Expire {
                reason: ExpiryReason::Timeout,
            })
            .when_action(ReservationAction::Confirm {
                ticket_ids: tickets(),
                paid_amount: Money::from_minor_units(22_000),
                payment_reference: "late".to_string(),
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(TicketingError::InvalidStateTransition {
                        state: "expired",
                        attempted: "confirm"
                    })
                );
                assert_eq!(state.reservation.status, ReservationStatus::Expired);
                assert_eq!(state.reservation.expiry_reason, Some(ExpiryReason::Timeout));
            })
            .run();
    }

    #[test]
    fn test_confirmed_reservation_cannot_expire() {
        ReducerTest::new(ReservationReducer::new())
            .with_env(env_at(test_time()))
            .given_state(open_reservation(tickets()))
            .when_action(ReservationAction::Confirm {
                ticket_ids: tickets(),
                paid_amount: Money::from_minor_units(22_000),
                payment_reference: "order-1".to_string(),
            })
            .when_action(ReservationAction::Expire {
                reason: ExpiryReason::Timeout,
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(TicketingError::InvalidStateTransition {
                        state: "confirmed",
                        attempted: "expire"
                    })
                );
                assert_eq!(state.reservation.status, ReservationStatus::Confirmed);
            })
            .run();
    }
}
