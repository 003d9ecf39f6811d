//! Aggregate reducers for Turnstile.
//!
//! Each aggregate instance lives in its own store and is the serialization
//! point for the mutations it owns:
//! - Capacity: one per event; reserve, confirm, release and refund
//! - Reservation: one per checkout; decides confirm versus expire
//! - Ticket: one per ticket; payment, check-in, cancellation and refund

pub mod capacity;
pub mod reservation;
pub mod ticket;

pub use capacity::{CapacityAction, CapacityLedger, CapacityReducer, CapacitySnapshot, CapacityState};
pub use reservation::{ReservationAction, ReservationEnvironment, ReservationReducer, ReservationState};
pub use ticket::{TicketAction, TicketEnvironment, TicketReducer, TicketState};
