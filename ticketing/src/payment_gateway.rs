//! Payment gateway boundary.
//!
//! The gateway is a black box: it accepts orders for a server-computed amount
//! and later reports their outcome through an asynchronous callback. Real
//! processor integrations implement [`PaymentGateway`]; [`MockPaymentGateway`]
//! serves development and tests.

use crate::types::{EventId, Money, OrderId, ReservationId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGatewayError {
    /// Gateway refused the request
    Rejected {
        /// Reason given by the gateway
        reason: String,
    },
    /// Gateway timeout
    Timeout,
    /// Other error
    Other {
        /// Error message
        message: String,
    },
}

impl std::fmt::Display for PaymentGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { reason } => write!(f, "Gateway rejected request: {reason}"),
            Self::Timeout => write!(f, "Gateway timeout"),
            Self::Other { message } => write!(f, "Payment error: {message}"),
        }
    }
}

impl std::error::Error for PaymentGatewayError {}

/// Context attached to an order so gateway dashboards can trace it back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMetadata {
    /// Reservation the order pays for
    pub reservation_id: ReservationId,
    /// Event the tickets belong to
    pub event_id: EventId,
    /// Number of tickets
    pub quantity: u32,
}

/// Outcome reported by the gateway for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Funds captured
    Captured,
    /// Payment failed
    Failed,
    /// Buyer or gateway voided the order
    Cancelled,
}

/// Inbound webhook body
///
/// Delivery is at least once and possibly out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    /// Order the callback is about
    pub order_id: OrderId,
    /// Amount the gateway reports as paid, in minor units
    pub paid_amount: Money,
    /// Outcome
    pub status: PaymentStatus,
}

/// Payment gateway trait
///
/// Abstraction over payment processors. Calls are made outside every
/// capacity and ticket lock.
pub trait PaymentGateway: Send + Sync {
    /// Create an order for exactly `amount`
    ///
    /// # Errors
    ///
    /// Returns error if the gateway refuses or cannot be reached
    fn create_order(
        &self,
        amount: Money,
        currency: &str,
        metadata: OrderMetadata,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<OrderId>> + Send>>;

    /// Refund part or all of a captured order
    ///
    /// # Errors
    ///
    /// Returns error if refund fails
    fn refund_order(
        &self,
        order_id: &OrderId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>>;
}

/// Order as recorded by [`MockPaymentGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOrder {
    /// Order id handed out
    pub order_id: OrderId,
    /// Amount requested
    pub amount: Money,
    /// Currency requested
    pub currency: String,
    /// Metadata supplied
    pub metadata: OrderMetadata,
}

#[derive(Debug, Default)]
struct MockLedger {
    orders: Vec<MockOrder>,
    refunds: Vec<(OrderId, Money)>,
}

/// Mock payment gateway
///
/// Accepts every request unless told to fail, and records what it was asked
/// to do.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    ledger: Arc<Mutex<MockLedger>>,
    failing: Arc<AtomicBool>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Make every following request fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Orders created so far
    #[must_use]
    pub fn orders(&self) -> Vec<MockOrder> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .clone()
    }

    /// Refunds issued so far
    #[must_use]
    pub fn refunds(&self) -> Vec<(OrderId, Money)> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refunds
            .clone()
    }

    fn check_available(&self) -> GatewayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PaymentGatewayError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_order(
        &self,
        amount: Money,
        currency: &str,
        metadata: OrderMetadata,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<OrderId>> + Send>> {
        let gateway = self.clone();
        let currency = currency.to_string();
        Box::pin(async move {
            gateway.check_available()?;

            let order_id = OrderId::new(format!("mock_order_{}", uuid::Uuid::new_v4()));

            tracing::info!(
                order_id = %order_id,
                amount = amount.minor_units(),
                currency = %currency,
                reservation_id = %metadata.reservation_id,
                "Mock order created"
            );

            gateway
                .ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .orders
                .push(MockOrder {
                    order_id: order_id.clone(),
                    amount,
                    currency,
                    metadata,
                });

            Ok(order_id)
        })
    }

    fn refund_order(
        &self,
        order_id: &OrderId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>> {
        let gateway = self.clone();
        let order_id = order_id.clone();
        Box::pin(async move {
            gateway.check_available()?;

            let refund_id = format!("mock_refund_{}", uuid::Uuid::new_v4());

            tracing::info!(
                order_id = %order_id,
                amount = amount.minor_units(),
                refund_id = %refund_id,
                "Mock refund processed"
            );

            gateway
                .ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .refunds
                .push((order_id, amount));

            Ok(refund_id)
        })
    }
}
