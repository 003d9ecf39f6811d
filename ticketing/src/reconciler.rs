//! Payment reconciliation.
//!
//! [`PaymentReconciler`] owns the mapping from gateway orders to
//! reservations. It creates each order for the server-computed amount, then
//! turns the gateway's callbacks into lifecycle transitions.
//!
//! Callbacks are delivered at least once and possibly out of order, so every
//! order record moves through a monotonic state machine:
//!
//! ```text
//! AwaitingPayment ──captured──> Settled   (duplicates: AlreadySettled)
//!        │
//!        └──failed/cancelled/expired──> Closed   (duplicates: AlreadyClosed)
//! ```
//!
//! A capture for a closed order is rejected; it never resurrects tickets.

use crate::error::{Result, TicketingError};
use crate::lifecycle::{IssuedTicket, PaymentConfirmation, PendingOrder, TicketLifecycle};
use crate::metrics;
use crate::payment_gateway::{OrderMetadata, PaymentCallback, PaymentGateway, PaymentStatus};
use crate::types::{
    EventId, ExpiryReason, HolderContact, Money, OrderId, ReservationId, ReservationStatus, Ticket,
    TicketId,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Where an order stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderState {
    /// Created at the gateway, no outcome yet
    AwaitingPayment,
    /// Payment captured and tickets issued
    Settled,
    /// Reservation released without payment
    Closed,
}

/// Result of handling one callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Payment captured, tickets issued
    Confirmed(Vec<IssuedTicket>),
    /// Capture reported again for a settled order
    AlreadySettled,
    /// Payment failed, reservation released
    Closed,
    /// Failure reported for an order that is already closed
    AlreadyClosed,
}

/// A reservation with its gateway order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkout {
    /// Gateway order to pay
    pub order_id: OrderId,
    /// Reservation and pricing
    pub order: PendingOrder,
}

/// A refunded ticket and the gateway's refund reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefundReceipt {
    /// The ticket, now `REFUNDED`
    pub ticket: Ticket,
    /// Gateway refund id
    pub refund_reference: String,
}

#[derive(Debug)]
struct OrderRecord {
    reservation_id: ReservationId,
    ticket_ids: Vec<TicketId>,
    state: OrderState,
}

impl OrderRecord {
    /// Record a final state; the ticket list is only needed while awaiting payment
    fn finish(&mut self, state: OrderState) {
        self.state = state;
        self.ticket_ids = Vec::new();
    }
}

/// Bridges the payment gateway and the ticket lifecycle
pub struct PaymentReconciler {
    lifecycle: Arc<TicketLifecycle>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
    orders: RwLock<HashMap<OrderId, Arc<Mutex<OrderRecord>>>>,
}

impl PaymentReconciler {
    /// Creates a reconciler charging in `currency`
    #[must_use]
    pub fn new(
        lifecycle: Arc<TicketLifecycle>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            gateway,
            currency: currency.into(),
            orders: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve tickets and open a gateway order for their exact amount
    ///
    /// The gateway is called after the capacity hold is placed and outside
    /// every lock. If it fails, the reservation is released.
    ///
    /// # Errors
    ///
    /// - any error of [`TicketLifecycle::create`]
    /// - [`TicketingError::PaymentGateway`] if the order cannot be created
    pub async fn begin_checkout(
        &self,
        event_id: EventId,
        quantity: u32,
        holder: HolderContact,
    ) -> Result<Checkout> {
        let order = self.lifecycle.create(event_id, quantity, holder).await?;

        let metadata = OrderMetadata {
            reservation_id: order.reservation_id,
            event_id,
            quantity,
        };
        let order_id = match self
            .gateway
            .create_order(order.amount, &self.currency, metadata)
            .await
        {
            Ok(order_id) => order_id,
            Err(gateway_error) => {
                metrics::record_payment("gateway_error");
                error!(
                    reservation_id = %order.reservation_id,
                    error = %gateway_error,
                    "Payment order could not be created"
                );
                if let Err(error) = self
                    .lifecycle
                    .close_reservation(order.reservation_id, ExpiryReason::PaymentFailed)
                    .await
                {
                    error!(reservation_id = %order.reservation_id, %error, "Reservation not released");
                }
                return Err(TicketingError::PaymentGateway(gateway_error.to_string()));
            },
        };

        self.orders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                order_id.clone(),
                Arc::new(Mutex::new(OrderRecord {
                    reservation_id: order.reservation_id,
                    ticket_ids: order.ticket_ids.clone(),
                    state: OrderState::AwaitingPayment,
                })),
            );

        info!(
            %order_id,
            reservation_id = %order.reservation_id,
            amount = order.amount.minor_units(),
            currency = %self.currency,
            "Checkout started"
        );

        Ok(Checkout { order_id, order })
    }

    /// Apply a gateway callback
    ///
    /// Idempotent per order id. Callbacks for one order are handled one at a
    /// time; callbacks for different orders do not wait on each other.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::UnknownOrder`] for orders this reconciler did not create
    /// - [`TicketingError::AmountMismatch`] if the paid amount is wrong; the
    ///   order keeps waiting for a correct capture or a failure
    /// - [`TicketingError::InvalidStateTransition`] for a capture after the
    ///   reservation was released, or a failure after settlement
    pub async fn handle_callback(&self, callback: PaymentCallback) -> Result<CallbackOutcome> {
        let record = self
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&callback.order_id)
            .cloned()
            .ok_or_else(|| TicketingError::UnknownOrder(callback.order_id.clone()))?;
        let mut record = record.lock().await;
        let order_id = &callback.order_id;

        match (record.state, callback.status) {
            (OrderState::AwaitingPayment, PaymentStatus::Captured) => {
                self.capture(&mut record, order_id, callback.paid_amount).await
            },

            (OrderState::AwaitingPayment, PaymentStatus::Failed | PaymentStatus::Cancelled) => {
                metrics::record_payment("failed");
                self.fail(&mut record, order_id).await
            },

            (OrderState::Settled, PaymentStatus::Captured) => {
                metrics::record_payment("duplicate");
                info!(%order_id, "Duplicate capture ignored");
                Ok(CallbackOutcome::AlreadySettled)
            },

            (OrderState::Settled, PaymentStatus::Failed | PaymentStatus::Cancelled) => {
                error!(%order_id, status = ?callback.status, "Failure reported for a settled order");
                Err(TicketingError::InvalidStateTransition {
                    state: "settled",
                    attempted: "fail payment",
                })
            },

            (OrderState::Closed, PaymentStatus::Captured) => {
                metrics::record_payment("late");
                error!(
                    %order_id,
                    paid = callback.paid_amount.minor_units(),
                    "Capture arrived after the reservation was released; refund required"
                );
                Err(TicketingError::InvalidStateTransition {
                    state: "closed",
                    attempted: "capture",
                })
            },

            (OrderState::Closed, PaymentStatus::Failed | PaymentStatus::Cancelled) => {
                Ok(CallbackOutcome::AlreadyClosed)
            },
        }
    }

    /// Refund a paid ticket and return the money through the gateway
    ///
    /// The ticket is `REFUNDED` before the gateway is called. A gateway
    /// failure is returned with the ticket already refunded so the payout can
    /// be retried out of band.
    ///
    /// # Errors
    ///
    /// - any error of [`TicketLifecycle::refund`]
    /// - [`TicketingError::PaymentGateway`] if the gateway refund failed
    pub async fn refund_ticket(&self, ticket_id: TicketId) -> Result<RefundReceipt> {
        let ticket = self.lifecycle.refund(ticket_id).await?;

        let Some(reference) = ticket.payment_reference.clone() else {
            error!(%ticket_id, "Refunded ticket has no payment reference");
            return Err(TicketingError::InvalidStateTransition {
                state: "unpaid",
                attempted: "refund",
            });
        };
        let order_id = OrderId::new(reference);

        let refund_reference = self
            .gateway
            .refund_order(&order_id, ticket.price)
            .await
            .map_err(|gateway_error| {
                error!(%ticket_id, %order_id, error = %gateway_error, "Gateway refund failed");
                TicketingError::PaymentGateway(gateway_error.to_string())
            })?;

        info!(%ticket_id, %order_id, %refund_reference, "Refund sent to gateway");
        Ok(RefundReceipt {
            ticket,
            refund_reference,
        })
    }

    /// Current state of an order
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::UnknownOrder`] for unknown orders.
    pub async fn order_state(&self, order_id: &OrderId) -> Result<OrderState> {
        let record = self
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
            .ok_or_else(|| TicketingError::UnknownOrder(order_id.clone()))?;
        let state = record.lock().await.state;
        Ok(state)
    }

    async fn capture(
        &self,
        record: &mut OrderRecord,
        order_id: &OrderId,
        paid_amount: Money,
    ) -> Result<CallbackOutcome> {
        let confirmation = PaymentConfirmation {
            payment_reference: order_id.to_string(),
            paid_amount,
        };
        let result = self
            .lifecycle
            .confirm_reservation(record.reservation_id, record.ticket_ids.clone(), confirmation)
            .await;

        match result {
            Ok(issued) => {
                record.finish(OrderState::Settled);
                Ok(CallbackOutcome::Confirmed(issued))
            },
            Err(error @ TicketingError::InvalidStateTransition { .. }) => {
                // Past the deadline: close now so a retry cannot succeed later
                self.close_late(record).await;
                warn!(%order_id, "Capture rejected: reservation no longer open");
                Err(error)
            },
            Err(error) => Err(error),
        }
    }

    async fn fail(&self, record: &mut OrderRecord, order_id: &OrderId) -> Result<CallbackOutcome> {
        match self
            .lifecycle
            .close_reservation(record.reservation_id, ExpiryReason::PaymentFailed)
            .await
        {
            Ok(_) => {
                record.finish(OrderState::Closed);
                info!(%order_id, "Payment failed, reservation released");
                Ok(CallbackOutcome::Closed)
            },
            Err(error @ TicketingError::InvalidStateTransition { .. }) => {
                let status = self.lifecycle.reservation(record.reservation_id).await?.status;
                match status {
                    ReservationStatus::Expired => {
                        record.finish(OrderState::Closed);
                        Ok(CallbackOutcome::AlreadyClosed)
                    },
                    ReservationStatus::Confirmed => {
                        record.finish(OrderState::Settled);
                        error!(%order_id, "Failure reported for a confirmed reservation");
                        Err(error)
                    },
                    ReservationStatus::Open => Err(error),
                }
            },
            Err(error) => Err(error),
        }
    }

    async fn close_late(&self, record: &mut OrderRecord) {
        let reservation_id = record.reservation_id;
        let Ok(reservation) = self.lifecycle.reservation(reservation_id).await else {
            return;
        };
        match reservation.status {
            ReservationStatus::Open => {
                if self
                    .lifecycle
                    .close_reservation(reservation_id, ExpiryReason::Timeout)
                    .await
                    .is_ok()
                {
                    record.finish(OrderState::Closed);
                }
            },
            ReservationStatus::Expired => record.finish(OrderState::Closed),
            ReservationStatus::Confirmed => record.finish(OrderState::Settled),
        }
    }
}
