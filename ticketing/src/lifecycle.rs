//! Ticket lifecycle orchestration.
//!
//! [`TicketLifecycle`] drives the buy, pay and check-in flow across the
//! pricing engine, the capacity ledger, the token service and one store per
//! reservation and per ticket:
//!
//! ```text
//! create ──> reserve capacity ──> price (fixed now) ──> PENDING tickets
//!                                                          │
//!        confirm_payment: reservation Open -> Confirmed ───┤──> PAID + tokens
//!        expire / cancel: reservation Open -> Expired ─────┘──> CANCELLED
//!
//! check_in: verify token ──> ticket PAID -> CHECKED_IN (exactly once)
//! refund:   ticket PAID -> REFUNDED ──> capacity returned to sale
//! ```
//!
//! The reservation status is the decision point between a late payment and
//! the expiry sweep. Once it has moved, the ticket transitions that follow
//! cannot be contested: only the winner of that race touches the tickets.

use crate::aggregates::{
    CapacityLedger, ReservationAction, ReservationEnvironment, ReservationReducer,
    ReservationState, TicketAction, TicketEnvironment, TicketReducer, TicketState,
};
use crate::config::TicketingConfig;
use crate::error::{Result, TicketingError};
use crate::metrics;
use crate::notifier::TicketNotifier;
use crate::pricing::{PriceQuote, PricingEngine};
use crate::token::{CheckInToken, ScanPayload, TokenService};
use crate::types::{
    Event, EventId, ExpiryReason, HolderContact, Money, Reservation, ReservationId,
    ReservationStatus, Ticket, TicketId, TicketStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use turnstile_core::environment::{Clock, RandomSource};
use turnstile_runtime::{KeyedStores, Store};

type ReservationStores = KeyedStores<
    ReservationId,
    ReservationState,
    ReservationAction,
    ReservationEnvironment,
    ReservationReducer,
>;
type ReservationStore =
    Store<ReservationState, ReservationAction, ReservationEnvironment, ReservationReducer>;
type TicketStores = KeyedStores<TicketId, TicketState, TicketAction, TicketEnvironment, TicketReducer>;

/// Result of a successful `create`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingOrder {
    /// Reservation holding the capacity
    pub reservation_id: ReservationId,
    /// Event the tickets are for
    pub event_id: EventId,
    /// Pending tickets, one per seat
    pub ticket_ids: Vec<TicketId>,
    /// Price of each ticket, fixed at creation
    pub unit_price: Money,
    /// Amount due: `unit_price * quantity`
    pub amount: Money,
    /// Payment must be confirmed strictly before this instant
    pub expires_at: DateTime<Utc>,
    /// How the unit price was computed
    pub quote: PriceQuote,
}

/// Payment reported by the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentConfirmation {
    /// External payment reference (the gateway order id)
    pub payment_reference: String,
    /// Amount the gateway reports as paid
    pub paid_amount: Money,
}

/// A paid ticket with its check-in credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedTicket {
    /// The ticket, now `PAID`
    pub ticket: Ticket,
    /// Token to present at the venue
    pub token: CheckInToken,
    /// QR payload: `<base-url>/ticket/<id>?token=<token>`
    pub scan_url: String,
}

/// Buy, pay and check-in orchestration
pub struct TicketLifecycle {
    reservation_ttl: chrono::Duration,
    max_tickets_per_order: u32,
    base_url: String,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    tokens: TokenService,
    events: RwLock<HashMap<EventId, Event>>,
    ledger: CapacityLedger,
    reservations: ReservationStores,
    /// Open reservations ordered by deadline
    open_reservations: RwLock<BTreeSet<(DateTime<Utc>, ReservationId)>>,
    /// Final state of reservations whose store was dropped
    closed_reservations: RwLock<HashMap<ReservationId, Reservation>>,
    tickets: TicketStores,
}

impl TicketLifecycle {
    /// Creates a lifecycle with no events registered
    #[must_use]
    pub fn new(
        config: &TicketingConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        notifier: Arc<dyn TicketNotifier>,
    ) -> Self {
        let ttl = if config.reservation_ttl > TicketingConfig::MAX_RESERVATION_TTL {
            warn!(
                ttl = ?config.reservation_ttl,
                max = ?TicketingConfig::MAX_RESERVATION_TTL,
                "Reservation TTL too long, capping"
            );
            TicketingConfig::MAX_RESERVATION_TTL
        } else {
            config.reservation_ttl
        };
        let reservation_ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| {
            warn!(?ttl, "Reservation TTL out of range, using 5 minutes");
            chrono::Duration::minutes(5)
        });

        if config.signing_secret.is_none() {
            warn!("No signing secret configured: payments cannot issue tickets and check-in is closed");
        }

        Self {
            reservation_ttl,
            max_tickets_per_order: config.max_tickets_per_order,
            base_url: config.base_url.clone(),
            tokens: TokenService::from_secret(config.signing_secret.clone()),
            events: RwLock::new(HashMap::new()),
            ledger: CapacityLedger::new(),
            reservations: KeyedStores::new(
                ReservationReducer::new(),
                ReservationEnvironment::new(Arc::clone(&clock)),
            ),
            open_reservations: RwLock::new(BTreeSet::new()),
            closed_reservations: RwLock::new(HashMap::new()),
            tickets: KeyedStores::new(
                TicketReducer::new(),
                TicketEnvironment::new(Arc::clone(&clock), notifier),
            ),
            clock,
            random,
        }
    }

    /// Clock the lifecycle reads
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Make an event available for sale
    ///
    /// # Errors
    ///
    /// - [`TicketingError::EventAlreadyRegistered`] for a known id
    /// - [`TicketingError::CapacityExceeded`] if more tickets are already
    ///   sold than the event holds
    pub fn register_event(&self, event: Event) -> Result<()> {
        if event.confirmed_sold > event.capacity {
            return Err(TicketingError::CapacityExceeded {
                requested: event.confirmed_sold,
                remaining: event.capacity,
            });
        }

        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.contains_key(&event.id) {
            return Err(TicketingError::EventAlreadyRegistered(event.id));
        }
        self.ledger
            .open(event.id, event.capacity, event.confirmed_sold)?;

        info!(
            event_id = %event.id,
            capacity = event.capacity,
            base_price = event.base_price.minor_units(),
            rules = event.rules.len(),
            "Event registered"
        );
        metrics::update_remaining_capacity(
            &event.id.to_string(),
            event.capacity - event.confirmed_sold,
        );
        events.insert(event.id, event);
        Ok(())
    }

    /// Event configuration with its current confirmed-sold count
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventNotFound`] for unknown events.
    pub async fn event(&self, event_id: EventId) -> Result<Event> {
        let event = self.registered_event(event_id)?;
        let snapshot = self.ledger.snapshot(event_id).await?;
        Ok(event.with_confirmed_sold(snapshot.confirmed_sold))
    }

    /// `capacity - confirmed_sold - pending`, for display
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::EventNotFound`] for unknown events.
    pub async fn remaining_capacity(&self, event_id: EventId) -> Result<u32> {
        self.ledger.remaining_capacity(event_id).await
    }

    fn registered_event(&self, event_id: EventId) -> Result<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .cloned()
            .ok_or(TicketingError::EventNotFound(event_id))
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Reserve `quantity` tickets and create them `PENDING`
    ///
    /// The unit price is computed once, here, from the confirmed-sold count
    /// observed while the hold was placed.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::InvalidQuantity`] outside `1..=max_tickets_per_order`
    /// - [`TicketingError::CapacityExceeded`] if too few tickets remain;
    ///   nothing is held in that case
    /// - [`TicketingError::PriceOverflow`] if the order total does not fit
    /// - [`TicketingError::DeadlineOutOfRange`] if `now + ttl` is not a
    ///   representable instant
    ///
    /// Every failure after the hold was placed releases it and removes any
    /// ticket already created.
    pub async fn create(
        &self,
        event_id: EventId,
        quantity: u32,
        holder: HolderContact,
    ) -> Result<PendingOrder> {
        let max = self.max_tickets_per_order;
        if quantity == 0 || quantity > max {
            return Err(TicketingError::InvalidQuantity {
                requested: quantity,
                max,
            });
        }

        let event = self.registered_event(event_id)?;
        let reservation_id = ReservationId::generate(self.random.as_ref());
        if self.reservations.get(&reservation_id).is_some() || self.closed(reservation_id).is_some() {
            error!(%reservation_id, "Reservation id collision");
            return Err(TicketingError::InvalidStateTransition {
                state: "issued",
                attempted: "create",
            });
        }

        let snapshot = match self.ledger.reserve(event_id, reservation_id, quantity).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                if let TicketingError::CapacityExceeded { remaining, .. } = error {
                    metrics::record_capacity_rejection();
                    info!(%event_id, quantity, remaining, "Reservation refused: sold out");
                }
                return Err(error);
            },
        };

        let now = self.clock.now();
        let priced = event.with_confirmed_sold(snapshot.confirmed_sold);
        let quote = PricingEngine::quote(&priced, &priced.rules, now);
        let unit_price = quote.total;

        let Some(amount) = unit_price.checked_mul(quantity) else {
            self.abandon(event_id, reservation_id, &[]).await?;
            error!(%event_id, quantity, unit_price = %unit_price, "Order total overflows");
            return Err(TicketingError::PriceOverflow);
        };

        let Some(expires_at) = now.checked_add_signed(self.reservation_ttl) else {
            self.abandon(event_id, reservation_id, &[]).await?;
            error!(%event_id, %now, ttl = %self.reservation_ttl, "Reservation deadline out of range");
            return Err(TicketingError::DeadlineOutOfRange);
        };

        let mut ticket_ids = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            let ticket_id = TicketId::generate(self.random.as_ref());
            let ticket = Ticket {
                id: ticket_id,
                event_id,
                reservation_id,
                holder: holder.clone(),
                status: TicketStatus::Pending,
                price: unit_price,
                created_at: now,
                paid_at: None,
                checked_in_at: None,
                payment_reference: None,
            };
            if self.tickets.insert(ticket_id, TicketState::new(ticket)).is_none() {
                self.abandon(event_id, reservation_id, &ticket_ids).await?;
                error!(%ticket_id, "Ticket id collision");
                return Err(TicketingError::InvalidStateTransition {
                    state: "issued",
                    attempted: "create",
                });
            }
            ticket_ids.push(ticket_id);
        }

        let reservation = Reservation {
            id: reservation_id,
            event_id,
            ticket_ids: ticket_ids.clone(),
            amount,
            expires_at,
            status: ReservationStatus::Open,
            payment_reference: None,
            expiry_reason: None,
        };
        if self
            .reservations
            .insert(reservation_id, ReservationState::new(reservation))
            .is_none()
        {
            self.abandon(event_id, reservation_id, &ticket_ids).await?;
            error!(%reservation_id, "Reservation id collision");
            return Err(TicketingError::InvalidStateTransition {
                state: "issued",
                attempted: "create",
            });
        }
        self.open_reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((expires_at, reservation_id));

        metrics::record_reservation_created();
        metrics::update_remaining_capacity(&event_id.to_string(), snapshot.remaining());
        info!(
            %event_id,
            %reservation_id,
            quantity,
            unit_price = unit_price.minor_units(),
            amount = amount.minor_units(),
            %expires_at,
            "Reservation created"
        );

        Ok(PendingOrder {
            reservation_id,
            event_id,
            ticket_ids,
            unit_price,
            amount,
            expires_at,
            quote,
        })
    }

    // ========================================================================
    // Payment
    // ========================================================================

    /// Confirm payment for exactly the tickets of one reservation
    ///
    /// All tickets move to `PAID` together and each receives a token.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::AmountMismatch`] if `paid_amount` differs from the
    ///   sum of the fixed prices or the ticket set differs from the
    ///   reservation's; tickets stay `PENDING`
    /// - [`TicketingError::InvalidStateTransition`] if the reservation is no
    ///   longer open or its deadline has passed
    /// - [`TicketingError::SigningUnavailable`] if no signing secret is set
    pub async fn confirm_payment(
        &self,
        ticket_ids: &[TicketId],
        payment: PaymentConfirmation,
    ) -> Result<Vec<IssuedTicket>> {
        let reservation_id = self.reservation_of(ticket_ids).await?;
        self.confirm_reservation(reservation_id, ticket_ids.to_vec(), payment)
            .await
    }

    pub(crate) async fn confirm_reservation(
        &self,
        reservation_id: ReservationId,
        ticket_ids: Vec<TicketId>,
        payment: PaymentConfirmation,
    ) -> Result<Vec<IssuedTicket>> {
        let store = self.live_reservation(reservation_id, "confirm").inspect_err(|error| {
            error!(%reservation_id, %error, payment_reference = %payment.payment_reference, "Payment confirmation refused");
        })?;

        // Sign before confirming: a confirmed reservation must be able to issue
        let tokens = ticket_ids
            .iter()
            .map(|ticket_id| self.tokens.sign(*ticket_id).map(|token| (*ticket_id, token)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|error| {
                error!(%reservation_id, %error, "Cannot issue tickets");
                metrics::record_payment("unsigned");
                TicketingError::SigningUnavailable
            })?;

        let (outcome, reservation) = store
            .send_and_inspect(
                ReservationAction::Confirm {
                    ticket_ids,
                    paid_amount: payment.paid_amount,
                    payment_reference: payment.payment_reference.clone(),
                },
                |state| (state.last_error.clone(), state.reservation.clone()),
            )
            .await?;

        if let Some(error) = outcome {
            match &error {
                TicketingError::AmountMismatch => {
                    metrics::record_security_rejection("amount_mismatch");
                    warn!(
                        security_event = true,
                        %reservation_id,
                        expected = reservation.amount.minor_units(),
                        paid = payment.paid_amount.minor_units(),
                        payment_reference = %payment.payment_reference,
                        "Payment does not match reservation"
                    );
                },
                _ => {
                    error!(
                        %reservation_id,
                        %error,
                        payment_reference = %payment.payment_reference,
                        "Payment confirmation refused"
                    );
                },
            }
            metrics::record_payment("rejected");
            return Err(error);
        }
        self.retire(&reservation);

        self.ledger
            .confirm(reservation.event_id, reservation_id)
            .await
            .inspect_err(|error| error!(%reservation_id, %error, "Capacity ledger out of step"))?;

        let mut issued = Vec::with_capacity(tokens.len());
        for (ticket_id, token) in tokens {
            let ticket = self
                .transition(
                    ticket_id,
                    TicketAction::MarkPaid {
                        payment_reference: payment.payment_reference.clone(),
                        token: token.clone(),
                    },
                )
                .await
                .inspect_err(|error| error!(%ticket_id, %error, "Confirmed ticket not marked paid"))?;
            let scan_url = ScanPayload::new(ticket_id, &token).to_url(&self.base_url);
            issued.push(IssuedTicket {
                ticket,
                token,
                scan_url,
            });
        }

        let now = self.clock.now();
        let waited = issued
            .first()
            .and_then(|issued| (now - issued.ticket.created_at).to_std().ok())
            .unwrap_or_default();
        let quantity = u32::try_from(issued.len()).unwrap_or(u32::MAX);
        metrics::record_payment("confirmed");
        metrics::record_reservation_confirmed(
            quantity,
            reservation.amount.minor_units(),
            waited.as_secs_f64(),
        );
        info!(
            %reservation_id,
            event_id = %reservation.event_id,
            quantity,
            amount = reservation.amount.minor_units(),
            payment_reference = %payment.payment_reference,
            "Payment confirmed, tickets issued"
        );

        Ok(issued)
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Release an unpaid reservation after its timeout
    ///
    /// `ticket_ids` must be exactly the reservation's tickets.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidStateTransition`] if the reservation
    /// is no longer open (for example, payment won the race).
    pub async fn expire_reservation(&self, ticket_ids: &[TicketId]) -> Result<Reservation> {
        let reservation_id = self.reservation_of(ticket_ids).await?;
        let reservation = self.reservation(reservation_id).await?;

        let mut claimed = ticket_ids.to_vec();
        let mut held = reservation.ticket_ids;
        claimed.sort_unstable();
        claimed.dedup();
        held.sort_unstable();
        if claimed != held {
            return Err(TicketingError::InvalidStateTransition {
                state: "partial reservation",
                attempted: "expire",
            });
        }

        self.close_reservation(reservation_id, ExpiryReason::Timeout)
            .await
    }

    /// Buyer abandoned checkout; same transition as expiry
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidStateTransition`] if the reservation
    /// is no longer open.
    pub async fn cancel_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.close_reservation(reservation_id, ExpiryReason::BuyerCancelled)
            .await
    }

    pub(crate) async fn close_reservation(
        &self,
        reservation_id: ReservationId,
        reason: ExpiryReason,
    ) -> Result<Reservation> {
        let store = self.live_reservation(reservation_id, "expire").inspect_err(|error| {
            warn!(%reservation_id, reason = reason.as_str(), %error, "Reservation not released");
        })?;

        let (outcome, reservation) = store
            .send_and_inspect(ReservationAction::Expire { reason }, |state| {
                (state.last_error.clone(), state.reservation.clone())
            })
            .await?;

        if let Some(error) = outcome {
            warn!(%reservation_id, reason = reason.as_str(), %error, "Reservation not released");
            return Err(error);
        }
        self.retire(&reservation);

        self.ledger
            .release(reservation.event_id, reservation_id)
            .await?;

        for ticket_id in &reservation.ticket_ids {
            if let Err(error) = self.transition(*ticket_id, TicketAction::Cancel).await {
                error!(%ticket_id, %error, "Released ticket not cancelled");
            }
        }

        metrics::record_reservation_expired(reason.as_str());
        if let Ok(remaining) = self.ledger.remaining_capacity(reservation.event_id).await {
            metrics::update_remaining_capacity(&reservation.event_id.to_string(), remaining);
        }
        info!(
            %reservation_id,
            event_id = %reservation.event_id,
            reason = reason.as_str(),
            released = reservation.ticket_ids.len(),
            "Reservation released"
        );

        Ok(reservation)
    }

    /// Open reservations whose deadline is at or before `now`
    ///
    /// Reads only the open-reservation index, earliest deadline first.
    #[must_use]
    pub fn open_reservations_due(&self, now: DateTime<Utc>) -> Vec<ReservationId> {
        let due: Vec<_> = self
            .open_reservations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, reservation_id)| *reservation_id)
            .collect();
        debug!(count = due.len(), "Reservations past deadline");
        due
    }

    // ========================================================================
    // Check-in
    // ========================================================================

    /// Admit a ticket at the venue
    ///
    /// The token is verified before any state is read. Of several concurrent
    /// scans of one ticket, exactly one succeeds.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::InvalidToken`] if the token does not verify
    /// - [`TicketingError::AlreadyCheckedIn`] on a re-scan
    /// - [`TicketingError::InvalidStateTransition`] if the ticket is not `PAID`
    pub async fn check_in(&self, ticket_id: TicketId, token: &str) -> Result<Ticket> {
        if !self.tokens.verify(ticket_id, token) {
            metrics::record_security_rejection("invalid_token");
            metrics::record_check_in("rejected");
            warn!(security_event = true, %ticket_id, "Check-in rejected: token does not verify");
            return Err(TicketingError::InvalidToken);
        }

        match self.transition(ticket_id, TicketAction::CheckIn).await {
            Ok(ticket) => {
                metrics::record_check_in("admitted");
                info!(%ticket_id, event_id = %ticket.event_id, "Ticket checked in");
                Ok(ticket)
            },
            Err(error @ TicketingError::AlreadyCheckedIn(_)) => {
                metrics::record_check_in("already_checked_in");
                warn!(%ticket_id, "Ticket scanned again after check-in");
                Err(error)
            },
            Err(error) => {
                metrics::record_check_in("rejected");
                warn!(%ticket_id, %error, "Check-in refused");
                Err(error)
            },
        }
    }

    /// Admit a ticket from its scanned QR payload
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidToken`] for payloads that do not
    /// parse, otherwise as [`Self::check_in`].
    pub async fn check_in_scan(&self, scanned: &str) -> Result<Ticket> {
        let Some(payload) = ScanPayload::parse(scanned) else {
            metrics::record_security_rejection("invalid_token");
            metrics::record_check_in("rejected");
            warn!(security_event = true, "Check-in rejected: malformed scan payload");
            return Err(TicketingError::InvalidToken);
        };
        self.check_in(payload.ticket_id, &payload.token).await
    }

    // ========================================================================
    // Refund
    // ========================================================================

    /// Refund a paid ticket and return its seat to sale
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::InvalidStateTransition`] unless the ticket
    /// is `PAID`.
    pub async fn refund(&self, ticket_id: TicketId) -> Result<Ticket> {
        let ticket = self
            .transition(ticket_id, TicketAction::Refund)
            .await
            .inspect_err(|error| warn!(%ticket_id, %error, "Refund refused"))?;

        self.ledger.refund(ticket.event_id, 1).await?;

        metrics::record_refund(ticket.price.minor_units());
        if let Ok(remaining) = self.ledger.remaining_capacity(ticket.event_id).await {
            metrics::update_remaining_capacity(&ticket.event_id.to_string(), remaining);
        }
        info!(
            %ticket_id,
            event_id = %ticket.event_id,
            amount = ticket.price.minor_units(),
            "Ticket refunded"
        );
        Ok(ticket)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state of a ticket
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::TicketNotFound`] for unknown tickets.
    pub async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket> {
        let store = self
            .tickets
            .get(&ticket_id)
            .ok_or(TicketingError::TicketNotFound(ticket_id))?;
        Ok(store.state(|state| state.ticket.clone()).await)
    }

    /// Current state of a reservation
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::ReservationNotFound`] for unknown reservations.
    pub async fn reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        if let Some(store) = self.reservations.get(&reservation_id) {
            return Ok(store.state(|state| state.reservation.clone()).await);
        }
        self.closed(reservation_id)
            .ok_or(TicketingError::ReservationNotFound(reservation_id))
    }

    /// Wait for in-flight holder notifications to finish
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::Store`] if notifications are still running
    /// when `timeout` elapses.
    pub async fn settle(&self, timeout: Duration) -> Result<()> {
        self.tickets.settle(timeout).await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Reservation the first ticket was created under
    async fn reservation_of(&self, ticket_ids: &[TicketId]) -> Result<ReservationId> {
        let Some(first) = ticket_ids.first() else {
            return Err(TicketingError::InvalidQuantity {
                requested: 0,
                max: self.max_tickets_per_order,
            });
        };
        Ok(self.ticket(*first).await?.reservation_id)
    }

    /// Store of a reservation that may still change
    ///
    /// A settled reservation answers with the transition it can no longer make.
    fn live_reservation(
        &self,
        reservation_id: ReservationId,
        attempted: &'static str,
    ) -> Result<ReservationStore> {
        if let Some(store) = self.reservations.get(&reservation_id) {
            return Ok(store);
        }
        match self.closed(reservation_id) {
            Some(reservation) => Err(TicketingError::InvalidStateTransition {
                state: reservation.status.as_str(),
                attempted,
            }),
            None => Err(TicketingError::ReservationNotFound(reservation_id)),
        }
    }

    fn closed(&self, reservation_id: ReservationId) -> Option<Reservation> {
        self.closed_reservations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reservation_id)
            .cloned()
    }

    /// Drop a settled reservation's store, keeping its final state
    ///
    /// The record is written before the store is removed, so a lookup
    /// always finds one of them.
    fn retire(&self, reservation: &Reservation) {
        self.open_reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(reservation.expires_at, reservation.id));
        self.closed_reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reservation.id, reservation.clone());
        self.reservations.remove(&reservation.id);
    }

    /// Undo a half-built `create`: drop its tickets and release the hold
    async fn abandon(
        &self,
        event_id: EventId,
        reservation_id: ReservationId,
        ticket_ids: &[TicketId],
    ) -> Result<()> {
        for ticket_id in ticket_ids {
            self.tickets.remove(ticket_id);
        }
        self.ledger.release(event_id, reservation_id).await?;
        Ok(())
    }

    /// Send a command to one ticket and return its state or the rejection
    async fn transition(&self, ticket_id: TicketId, action: TicketAction) -> Result<Ticket> {
        let store = self
            .tickets
            .get(&ticket_id)
            .ok_or(TicketingError::TicketNotFound(ticket_id))?;
        let (outcome, ticket) = store
            .send_and_inspect(action, |state| (state.last_error.clone(), state.ticket.clone()))
            .await?;
        outcome.map_or(Ok(ticket), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notifier::LoggingNotifier;
    use crate::token::SigningSecret;
    use crate::types::{AdjustmentKind, PricingRule, RuleId, TriggerKind};
    use turnstile_testing::{FixedClock, SeededRandom, test_time};

    fn lifecycle() -> TicketLifecycle {
        let config = TicketingConfig::default()
            .with_signing_secret(SigningSecret::generate(&SeededRandom::new(3)));
        TicketLifecycle::new(
            &config,
            Arc::new(FixedClock::new(test_time())),
            Arc::new(SeededRandom::new(4)),
            Arc::new(LoggingNotifier),
        )
    }

    fn holder() -> HolderContact {
        HolderContact::new("Grace", "grace@example.com")
    }

    fn concert(capacity: u32) -> Event {
        Event::new(
            Money::from_minor_units(10_000),
            capacity,
            test_time() + chrono::Duration::days(30),
        )
    }

    #[tokio::test]
    async fn test_quantity_must_be_within_order_limit() {
        let lifecycle = lifecycle();
        let event = concert(100);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        for quantity in [0, 9] {
            let result = lifecycle.create(event_id, quantity, holder()).await;
            assert_eq!(
                result,
                Err(TicketingError::InvalidQuantity { requested: quantity, max: 8 })
            );
        }
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_price_is_fixed_from_sold_count_at_creation() {
        let lifecycle = lifecycle();
        let event = concert(10).with_confirmed_sold(6).with_rule(PricingRule::new(
            RuleId(1),
            TriggerKind::DemandPercent,
            50,
            AdjustmentKind::Percentage,
            10,
        ));
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let order = lifecycle.create(event_id, 2, holder()).await.unwrap();

        assert_eq!(order.unit_price, Money::from_minor_units(11_000));
        assert_eq!(order.amount, Money::from_minor_units(22_000));
        assert_eq!(order.expires_at, test_time() + chrono::Duration::minutes(5));
        for ticket_id in &order.ticket_ids {
            let ticket = lifecycle.ticket(*ticket_id).await.unwrap();
            assert_eq!(ticket.status, TicketStatus::Pending);
            assert_eq!(ticket.price, Money::from_minor_units(11_000));
        }
    }

    #[tokio::test]
    async fn test_overflowing_total_releases_the_hold() {
        let lifecycle = lifecycle();
        let event = Event::new(Money::from_minor_units(u64::MAX), 10, test_time());
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let result = lifecycle.create(event_id, 2, holder()).await;

        assert_eq!(result, Err(TicketingError::PriceOverflow));
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_overlong_ttl_is_capped() {
        let config = TicketingConfig::default()
            .with_signing_secret(SigningSecret::generate(&SeededRandom::new(3)))
            .with_reservation_ttl(Duration::from_secs(9_000_000_000_000_000));
        let lifecycle = TicketLifecycle::new(
            &config,
            Arc::new(FixedClock::new(test_time())),
            Arc::new(SeededRandom::new(4)),
            Arc::new(LoggingNotifier),
        );
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let order = lifecycle.create(event_id, 1, holder()).await.unwrap();

        assert_eq!(order.expires_at, test_time() + chrono::Duration::hours(24));
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_releases_the_hold() {
        let config = TicketingConfig::default()
            .with_signing_secret(SigningSecret::generate(&SeededRandom::new(3)));
        let lifecycle = TicketLifecycle::new(
            &config,
            Arc::new(FixedClock::new(DateTime::<Utc>::MAX_UTC)),
            Arc::new(SeededRandom::new(4)),
            Arc::new(LoggingNotifier),
        );
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let result = lifecycle.create(event_id, 2, holder()).await;

        assert_eq!(result, Err(TicketingError::DeadlineOutOfRange));
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 5);
        assert!(lifecycle.tickets.is_empty());
        assert!(lifecycle.reservations.is_empty());
    }

    struct ConstantRandom;

    impl RandomSource for ConstantRandom {
        fn fill_bytes(&self, dest: &mut [u8]) {
            dest.fill(0x5a);
        }
    }

    #[tokio::test]
    async fn test_ticket_id_collision_leaves_nothing_behind() {
        let config = TicketingConfig::default()
            .with_signing_secret(SigningSecret::generate(&SeededRandom::new(3)));
        let lifecycle = TicketLifecycle::new(
            &config,
            Arc::new(FixedClock::new(test_time())),
            Arc::new(ConstantRandom),
            Arc::new(LoggingNotifier),
        );
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let result = lifecycle.create(event_id, 2, holder()).await;

        assert_eq!(
            result,
            Err(TicketingError::InvalidStateTransition {
                state: "issued",
                attempted: "create"
            })
        );
        let first_ticket = TicketId::generate(&ConstantRandom);
        assert_eq!(
            lifecycle.ticket(first_ticket).await,
            Err(TicketingError::TicketNotFound(first_ticket))
        );
        assert!(lifecycle.tickets.is_empty());
        assert!(lifecycle.reservations.is_empty());
        assert!(lifecycle.open_reservations_due(DateTime::<Utc>::MAX_UTC).is_empty());
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_same_seed_gives_same_ids() {
        let first = lifecycle();
        let second = lifecycle();
        let first_event = concert(5);
        let second_event = concert(5);
        let (first_id, second_id) = (first_event.id, second_event.id);
        first.register_event(first_event).unwrap();
        second.register_event(second_event).unwrap();

        let a = first.create(first_id, 2, holder()).await.unwrap();
        let b = second.create(second_id, 2, holder()).await.unwrap();

        assert_eq!(a.reservation_id, b.reservation_id);
        assert_eq!(a.ticket_ids, b.ticket_ids);
    }

    #[tokio::test]
    async fn test_settled_reservations_leave_the_live_set() {
        let lifecycle = lifecycle();
        let event = concert(10);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();

        let paid = lifecycle.create(event_id, 1, holder()).await.unwrap();
        let abandoned = lifecycle.create(event_id, 2, holder()).await.unwrap();
        let waiting = lifecycle.create(event_id, 1, holder()).await.unwrap();
        assert_eq!(lifecycle.reservations.len(), 3);

        lifecycle
            .confirm_payment(
                &paid.ticket_ids,
                PaymentConfirmation {
                    payment_reference: "order-live".to_string(),
                    paid_amount: paid.amount,
                },
            )
            .await
            .unwrap();
        lifecycle
            .cancel_reservation(abandoned.reservation_id)
            .await
            .unwrap();

        assert_eq!(lifecycle.reservations.len(), 1);
        assert!(lifecycle.reservations.get(&waiting.reservation_id).is_some());
        assert_eq!(
            lifecycle.open_reservations_due(DateTime::<Utc>::MAX_UTC),
            vec![waiting.reservation_id]
        );

        let settled = lifecycle.reservation(paid.reservation_id).await.unwrap();
        assert_eq!(settled.status, ReservationStatus::Confirmed);
        assert_eq!(settled.payment_reference.as_deref(), Some("order-live"));
        let released = lifecycle.reservation(abandoned.reservation_id).await.unwrap();
        assert_eq!(released.status, ReservationStatus::Expired);

        assert_eq!(
            lifecycle.cancel_reservation(paid.reservation_id).await,
            Err(TicketingError::InvalidStateTransition {
                state: "confirmed",
                attempted: "expire"
            })
        );
        assert_eq!(
            lifecycle
                .confirm_payment(
                    &abandoned.ticket_ids,
                    PaymentConfirmation {
                        payment_reference: "order-late".to_string(),
                        paid_amount: abandoned.amount,
                    },
                )
                .await,
            Err(TicketingError::InvalidStateTransition {
                state: "expired",
                attempted: "confirm"
            })
        );
    }

    #[tokio::test]
    async fn test_register_event_rejects_duplicates_and_oversold_events() {
        let lifecycle = lifecycle();
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event.clone()).unwrap();

        assert_eq!(
            lifecycle.register_event(event),
            Err(TicketingError::EventAlreadyRegistered(event_id))
        );
        assert!(matches!(
            lifecycle.register_event(concert(5).with_confirmed_sold(6)),
            Err(TicketingError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_ticket_with_forged_token_is_rejected_before_state() {
        let lifecycle = lifecycle();
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();
        let order = lifecycle.create(event_id, 1, holder()).await.unwrap();

        let result = lifecycle
            .check_in(order.ticket_ids[0], "A".repeat(43).as_str())
            .await;

        assert_eq!(result, Err(TicketingError::InvalidToken));
        let ticket = lifecycle.ticket(order.ticket_ids[0]).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Pending);
    }

    #[tokio::test]
    async fn test_event_query_reports_ledger_sold_count() {
        let lifecycle = lifecycle();
        let event = concert(5);
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();
        let order = lifecycle.create(event_id, 2, holder()).await.unwrap();

        lifecycle
            .confirm_payment(
                &order.ticket_ids,
                PaymentConfirmation {
                    payment_reference: "order-1".to_string(),
                    paid_amount: order.amount,
                },
            )
            .await
            .unwrap();

        assert_eq!(lifecycle.event(event_id).await.unwrap().confirmed_sold, 2);
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 3);
    }
}
