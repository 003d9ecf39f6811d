//! Ticket aggregate.
//!
//! Each ticket has its own store, so duplicate scans of one ticket are
//! reduced one after the other (exactly one observes `Paid -> CheckedIn`)
//! while different tickets never wait on each other.
//!
//! ```text
//! Pending ──MarkPaid──> Paid ──CheckIn──> CheckedIn
//!    │                   │
//!  Cancel              Refund
//!    v                   v
//! Cancelled           Refunded
//! ```
//!
//! No transition skips a state: a pending ticket cannot be checked in.

use crate::error::TicketingError;
use crate::notifier::{TicketNotice, TicketNotifier, deliver};
use crate::token::CheckInToken;
use crate::types::{Ticket, TicketStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use turnstile_core::{
    SmallVec, async_effect, effect::Effect, environment::Clock, reducer::Reducer, smallvec,
};

// ============================================================================
// State
// ============================================================================

/// State of one ticket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketState {
    /// The ticket
    pub ticket: Ticket,
    /// Outcome of the last command (`None` on success)
    pub last_error: Option<TicketingError>,
}

impl TicketState {
    /// Wrap a freshly created ticket
    #[must_use]
    pub const fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            last_error: None,
        }
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the ticket aggregate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TicketAction {
    // Commands
    /// Payment confirmed
    MarkPaid {
        /// External payment reference
        payment_reference: String,
        /// Token issued for this ticket, forwarded to the holder
        token: CheckInToken,
    },

    /// Reservation released without payment
    Cancel,

    /// Scanned at the venue with a verified token
    CheckIn,

    /// Payment returned to the buyer
    Refund,

    // Events
    /// Ticket paid
    Paid {
        /// External payment reference
        payment_reference: String,
        /// When
        paid_at: DateTime<Utc>,
    },

    /// Ticket cancelled
    Cancelled,

    /// Ticket used
    CheckedIn {
        /// When
        checked_in_at: DateTime<Utc>,
    },

    /// Ticket refunded
    Refunded,

    /// Command rejected
    Rejected {
        /// Why
        error: TicketingError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the ticket aggregate
#[derive(Clone)]
pub struct TicketEnvironment {
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Holder notifications
    pub notifier: Arc<dyn TicketNotifier>,
}

impl TicketEnvironment {
    /// Creates a new `TicketEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, notifier: Arc<dyn TicketNotifier>) -> Self {
        Self { clock, notifier }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the ticket aggregate
#[derive(Clone, Debug, Default)]
pub struct TicketReducer;

impl TicketReducer {
    /// Creates a new `TicketReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn illegal(status: TicketStatus, attempted: &'static str) -> TicketAction {
        TicketAction::Rejected {
            error: TicketingError::InvalidStateTransition {
                state: status.as_str(),
                attempted,
            },
        }
    }

    fn apply_event(state: &mut TicketState, action: &TicketAction) {
        let ticket = &mut state.ticket;
        match action {
            TicketAction::Paid {
                payment_reference,
                paid_at,
            } => {
                ticket.status = TicketStatus::Paid;
                ticket.paid_at = Some(*paid_at);
                ticket.payment_reference = Some(payment_reference.clone());
                state.last_error = None;
            },
            TicketAction::Cancelled => {
                ticket.status = TicketStatus::Cancelled;
                state.last_error = None;
            },
            TicketAction::CheckedIn { checked_in_at } => {
                ticket.status = TicketStatus::CheckedIn;
                ticket.checked_in_at = Some(*checked_in_at);
                state.last_error = None;
            },
            TicketAction::Refunded => {
                ticket.status = TicketStatus::Refunded;
                state.last_error = None;
            },
            TicketAction::Rejected { error } => {
                state.last_error = Some(error.clone());
            },
            // Commands don't modify state
            TicketAction::MarkPaid { .. }
            | TicketAction::Cancel
            | TicketAction::CheckIn
            | TicketAction::Refund => {},
        }
    }

    /// Notice to send after a successful transition
    fn notice_for(ticket: &Ticket, event: &TicketAction, token: Option<CheckInToken>) -> Option<TicketNotice> {
        let ticket_id = ticket.id;
        let event_id = ticket.event_id;
        match event {
            TicketAction::Paid { .. } => token.map(|token| TicketNotice::Issued {
                ticket_id,
                event_id,
                holder: ticket.holder.clone(),
                token,
            }),
            TicketAction::CheckedIn { checked_in_at } => Some(TicketNotice::CheckedIn {
                ticket_id,
                event_id,
                at: *checked_in_at,
            }),
            TicketAction::Cancelled => Some(TicketNotice::Cancelled {
                ticket_id,
                event_id,
            }),
            TicketAction::Refunded => Some(TicketNotice::Refunded {
                ticket_id,
                event_id,
                amount: ticket.price,
            }),
            _ => None,
        }
    }
}

impl Reducer for TicketReducer {
    type State = TicketState;
    type Action = TicketAction;
    type Environment = TicketEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let status = state.ticket.status;
        let now = env.clock.now();
        let mut issued_token = None;

        let event = match action {
            TicketAction::MarkPaid {
                payment_reference,
                token,
            } => {
                if status == TicketStatus::Pending {
                    issued_token = Some(token);
                    TicketAction::Paid {
                        payment_reference,
                        paid_at: now,
                    }
                } else {
                    Self::illegal(status, "mark paid")
                }
            },

            TicketAction::Cancel => {
                if status == TicketStatus::Pending {
                    TicketAction::Cancelled
                } else {
                    Self::illegal(status, "cancel")
                }
            },

            TicketAction::CheckIn => match status {
                TicketStatus::Paid => TicketAction::CheckedIn { checked_in_at: now },
                // Re-scans are reported distinctly so operators can spot them
                TicketStatus::CheckedIn => TicketAction::Rejected {
                    error: TicketingError::AlreadyCheckedIn(state.ticket.id),
                },
                _ => Self::illegal(status, "check in"),
            },

            TicketAction::Refund => {
                if status == TicketStatus::Paid {
                    TicketAction::Refunded
                } else {
                    Self::illegal(status, "refund")
                }
            },

            // Events are applied as given
            event => event,
        };

        Self::apply_event(state, &event);

        match Self::notice_for(&state.ticket, &event, issued_token) {
            Some(notice) => {
                let notifier = Arc::clone(&env.notifier);
                smallvec![async_effect! {
                    deliver(notifier.as_ref(), notice).await;
                    None
                }]
            },
            None => SmallVec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notifier::LoggingNotifier;
    use crate::token::{SigningSecret, TokenService};
    use crate::types::{EventId, HolderContact, Money, ReservationId, TicketId};
    use turnstile_testing::{FixedClock, ReducerTest, SeededRandom, assertions, test_time};

    fn env() -> TicketEnvironment {
        TicketEnvironment::new(Arc::new(FixedClock::new(test_time())), Arc::new(LoggingNotifier))
    }

    fn ticket_in(status: TicketStatus) -> TicketState {
        TicketState::new(Ticket {
            id: TicketId::generate(&SeededRandom::new(5)),
            event_id: EventId::new(),
            reservation_id: ReservationId::new(),
            holder: HolderContact::new("Ada", "ada@example.com"),
            status,
            price: Money::from_minor_units(5_000),
            created_at: test_time(),
            paid_at: None,
            checked_in_at: None,
            payment_reference: None,
        })
    }

    fn token() -> CheckInToken {
        let tokens = TokenService::new(SigningSecret::generate(&SeededRandom::new(1)));
        tokens.sign(TicketId::generate(&SeededRandom::new(5))).unwrap()
    }

    #[test]
    fn test_mark_paid_notifies_holder() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Pending))
            .when_action(TicketAction::MarkPaid {
                payment_reference: "order-7".to_string(),
                token: token(),
            })
            .then_state(|state| {
                assert_eq!(state.ticket.status, TicketStatus::Paid);
                assert_eq!(state.ticket.paid_at, Some(test_time()));
                assert_eq!(state.ticket.payment_reference.as_deref(), Some("order-7"));
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn test_check_in_from_paid() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Paid))
            .when_action(TicketAction::CheckIn)
            .then_state(|state| {
                assert_eq!(state.last_error, None);
                assert_eq!(state.ticket.status, TicketStatus::CheckedIn);
                assert_eq!(state.ticket.checked_in_at, Some(test_time()));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_second_check_in_is_distinct_from_success() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Paid))
            .when_action(TicketAction::CheckIn)
            .when_action(TicketAction::CheckIn)
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(TicketingError::AlreadyCheckedIn(_))));
                assert_eq!(state.ticket.status, TicketStatus::CheckedIn);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_pending_ticket_cannot_check_in() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Pending))
            .when_action(TicketAction::CheckIn)
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(TicketingError::InvalidStateTransition {
                        state: "pending",
                        attempted: "check in"
                    })
                );
                assert_eq!(state.ticket.status, TicketStatus::Pending);
                assert_eq!(state.ticket.checked_in_at, None);
            })
            .run();
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for status in [
            TicketStatus::Cancelled,
            TicketStatus::Refunded,
            TicketStatus::CheckedIn,
        ] {
            for action in [TicketAction::Cancel, TicketAction::Refund] {
                ReducerTest::new(TicketReducer::new())
                    .with_env(env())
                    .given_state(ticket_in(status))
                    .when_action(action)
                    .then_state(move |state| {
                        assert!(state.last_error.is_some());
                        assert_eq!(state.ticket.status, status);
                    })
                    .run();
            }
        }
    }

    #[test]
    fn test_refund_from_paid() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Paid))
            .when_action(TicketAction::Refund)
            .then_state(|state| assert_eq!(state.ticket.status, TicketStatus::Refunded))
            .run();
    }

    #[test]
    fn test_paid_ticket_cannot_be_cancelled() {
        ReducerTest::new(TicketReducer::new())
            .with_env(env())
            .given_state(ticket_in(TicketStatus::Paid))
            .when_action(TicketAction::Cancel)
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(TicketingError::InvalidStateTransition { state: "paid", .. })
                ));
            })
            .run();
    }
}
