//! Error taxonomy for ticketing operations.

use crate::types::{EventId, OrderId, ReservationId, TicketId};
use thiserror::Error;
use turnstile_runtime::StoreError;

/// Errors returned by ticketing operations
///
/// Every variant is returned to the caller as a typed result. `AmountMismatch`
/// and `InvalidToken` are security relevant: their `Display` output carries no
/// detail about which part of the check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TicketingError {
    /// The reservation would oversell the event
    #[error("Capacity exceeded: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        /// Tickets requested
        requested: u32,
        /// Tickets still available
        remaining: u32,
    },

    /// Reported payment does not match the server-computed amount
    #[error("Payment rejected")]
    AmountMismatch,

    /// Check-in credential failed verification
    #[error("Ticket rejected")]
    InvalidToken,

    /// The ticket was already scanned
    #[error("Ticket {0} is already checked in")]
    AlreadyCheckedIn(TicketId),

    /// The attempted transition is not legal from the current state
    #[error("Cannot {attempted} from state {state}")]
    InvalidStateTransition {
        /// State the entity was in
        state: &'static str,
        /// Transition that was attempted
        attempted: &'static str,
    },

    /// Event is not registered
    #[error("Event {0} not found")]
    EventNotFound(EventId),

    /// Event was registered twice
    #[error("Event {0} is already registered")]
    EventAlreadyRegistered(EventId),

    /// Ticket does not exist
    #[error("Ticket {0} not found")]
    TicketNotFound(TicketId),

    /// Reservation does not exist
    #[error("Reservation {0} not found")]
    ReservationNotFound(ReservationId),

    /// Payment callback for an order this service never created
    #[error("Unknown payment order {0}")]
    UnknownOrder(OrderId),

    /// Ticket quantity outside the allowed range
    #[error("Quantity {requested} is invalid: must be between 1 and {max}")]
    InvalidQuantity {
        /// Quantity requested
        requested: u32,
        /// Largest allowed order
        max: u32,
    },

    /// Order total does not fit the money type
    #[error("Order total overflows")]
    PriceOverflow,

    /// The payment deadline falls outside the representable time range
    #[error("Reservation deadline out of range")]
    DeadlineOutOfRange,

    /// No signing secret is configured, so tickets cannot be issued
    #[error("Ticket signing is unavailable")]
    SigningUnavailable,

    /// The external payment gateway failed
    #[error("Payment gateway error: {0}")]
    PaymentGateway(String),

    /// The store runtime rejected the action
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TicketingError {
    /// Message safe to show to a buyer or scanner operator
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::CapacityExceeded { .. } => "Sold out: not enough tickets remain".to_string(),
            Self::AlreadyCheckedIn(_) => "Ticket has already been used".to_string(),
            Self::AmountMismatch | Self::InvalidToken => "Request rejected".to_string(),
            Self::InvalidQuantity { .. } => self.to_string(),
            Self::EventNotFound(_)
            | Self::TicketNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::UnknownOrder(_) => "Not found".to_string(),
            Self::InvalidStateTransition { .. }
            | Self::EventAlreadyRegistered(_)
            | Self::PriceOverflow
            | Self::DeadlineOutOfRange
            | Self::SigningUnavailable
            | Self::PaymentGateway(_)
            | Self::Store(_) => "Request could not be completed".to_string(),
        }
    }

    /// Whether this outcome should be logged and counted as a security event
    #[must_use]
    pub const fn is_security_event(&self) -> bool {
        matches!(self, Self::AmountMismatch | Self::InvalidToken)
    }

    /// Stable label for metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AmountMismatch => "amount_mismatch",
            Self::InvalidToken => "invalid_token",
            Self::AlreadyCheckedIn(_) => "already_checked_in",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::EventNotFound(_) => "event_not_found",
            Self::EventAlreadyRegistered(_) => "event_already_registered",
            Self::TicketNotFound(_) => "ticket_not_found",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::UnknownOrder(_) => "unknown_order",
            Self::InvalidQuantity { .. } => "invalid_quantity",
            Self::PriceOverflow => "price_overflow",
            Self::DeadlineOutOfRange => "deadline_out_of_range",
            Self::SigningUnavailable => "signing_unavailable",
            Self::PaymentGateway(_) => "payment_gateway",
            Self::Store(_) => "store",
        }
    }
}

/// Result type for ticketing operations
pub type Result<T> = std::result::Result<T, TicketingError>;
