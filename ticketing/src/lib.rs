//! Turnstile ticketing core.
//!
//! Prices, issues and admits tickets for time-boxed events when buyers retry
//! payments, attackers forge check-in credentials, and many buyers race for
//! the last seats.
//!
//! # Architecture
//!
//! ```text
//!                    ┌───────────────────┐
//!   gateway ───────> │ PaymentReconciler │ <─── begin_checkout / refund_ticket
//!   callbacks        └─────────┬─────────┘
//!                              │
//!                    ┌─────────v─────────┐       ┌──────────────────┐
//!   check_in ──────> │  TicketLifecycle  │ ────> │ ReservationSweeper│
//!                    └─┬──────┬──────┬───┘       └──────────────────┘
//!                      │      │      │
//!        ┌─────────────v┐ ┌───v────┐ ┌v─────────────┐
//!        │PricingEngine │ │ Token  │ │CapacityLedger│  one store per event
//!        │  (pure)      │ │Service │ └──────────────┘
//!        └──────────────┘ └────────┘  reservation / ticket stores: one per id
//! ```
//!
//! # Key guarantees
//!
//! ## 1. No overselling
//!
//! Every reserve, confirm, release and refund for one event is reduced by
//! that event's store, one at a time:
//!
//! ```text
//! remaining = capacity - confirmed_sold - pending
//!
//! if quantity > remaining {
//!     return CapacityExceeded   // nothing is held
//! }
//! ```
//!
//! ## 2. Exactly-once check-in
//!
//! Each ticket has its own store. Of several concurrent scans, exactly one
//! observes `PAID -> CHECKED_IN`; the others get `AlreadyCheckedIn`.
//!
//! ## 3. Tamper-evident tokens
//!
//! Tokens are an HMAC-SHA256 of the ticket id, compared in constant time.
//! Without a configured secret, every check-in is refused.
//!
//! ## 4. Server-side amounts
//!
//! Prices are computed once, at reservation time, and a payment must match
//! their sum exactly. No client-supplied amount is ever trusted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod payment_gateway;
pub mod pricing;
pub mod reconciler;
pub mod sweeper;
pub mod token;
pub mod types;

pub use config::{Config, ConfigError, ServerConfig, TicketingConfig};
pub use error::{Result, TicketingError};
pub use lifecycle::{IssuedTicket, PaymentConfirmation, PendingOrder, TicketLifecycle};
pub use notifier::{LoggingNotifier, RecordingNotifier, TicketNotice, TicketNotifier};
pub use payment_gateway::{
    MockPaymentGateway, PaymentCallback, PaymentGateway, PaymentGatewayError, PaymentStatus,
};
pub use pricing::{PriceQuote, PricingEngine};
pub use reconciler::{CallbackOutcome, Checkout, OrderState, PaymentReconciler, RefundReceipt};
pub use sweeper::ReservationSweeper;
pub use token::{CheckInToken, ScanPayload, SigningSecret, TokenService};
pub use types::*;
