//! Domain types for Turnstile.
//!
//! Identifiers, money, events with their pricing rules, tickets and
//! reservations. Everything here is plain data; behaviour lives in the
//! pricing engine, the token service and the aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use turnstile_core::environment::RandomSource;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique, unguessable identifier for a ticket
///
/// Ticket ids are printed on the ticket itself, so they are drawn from an
/// injected CSPRNG rather than a process-global generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TicketId(Uuid);

impl TicketId {
    /// Generate a fresh ticket id from `random`
    #[must_use]
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; 16];
        random.fill_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Create a `TicketId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TicketId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Generate a reservation id from `random`
    #[must_use]
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; 16];
        random.fill_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order identifier assigned by the external payment gateway
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap a gateway-assigned order id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw gateway id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a pricing rule within an event's configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

// ============================================================================
// Money
// ============================================================================

/// Amount of money in minor currency units (cents, paise, ...)
///
/// Never floating point. The currency itself is a deployment-wide constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from minor units
    #[must_use]
    pub const fn from_minor_units(units: u64) -> Self {
        Self(units)
    }

    /// Returns the amount in minor units
    #[must_use]
    pub const fn minor_units(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies by a ticket quantity with overflow checking
    #[must_use]
    pub fn checked_mul(self, quantity: u32) -> Option<Self> {
        self.0.checked_mul(u64::from(quantity)).map(Self)
    }

    /// Sum of amounts, `None` on overflow
    pub fn checked_sum<I: IntoIterator<Item = Self>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, |total, amount| total.checked_add(amount))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Events and pricing rules
// ============================================================================

/// What makes a pricing rule fire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    /// Fires when the event starts within `threshold` hours
    TimeBeforeEvent,
    /// Fires when at least `threshold` percent of capacity is sold
    DemandPercent,
}

/// How a fired rule changes the price
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentKind {
    /// Adds `base_price * magnitude / 100`
    Percentage,
    /// Adds `magnitude` minor units
    FixedMinorUnits,
}

/// A dynamic pricing rule
///
/// Rules are configuration owned by the event; the pricing engine only reads them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    /// Rule identifier
    pub id: RuleId,
    /// Trigger kind
    pub trigger_kind: TriggerKind,
    /// Hours (time rules) or percent sold (demand rules)
    pub threshold: u32,
    /// Adjustment kind
    pub adjustment_kind: AdjustmentKind,
    /// Signed magnitude: percent, or minor units
    pub magnitude: i64,
    /// Inactive rules are skipped
    pub active: bool,
}

impl PricingRule {
    /// Creates an active rule
    #[must_use]
    pub const fn new(
        id: RuleId,
        trigger_kind: TriggerKind,
        threshold: u32,
        adjustment_kind: AdjustmentKind,
        magnitude: i64,
    ) -> Self {
        Self {
            id,
            trigger_kind,
            threshold,
            adjustment_kind,
            magnitude,
            active: true,
        }
    }

    /// Same rule, switched off
    #[must_use]
    pub const fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Discounted price available until a deadline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyBird {
    /// Starting price while the window is open
    pub price: Money,
    /// First instant at which the early-bird price no longer applies
    pub deadline: DateTime<Utc>,
}

/// A time-boxed event tickets are sold for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Base unit price
    pub base_price: Money,
    /// Total sellable tickets
    pub capacity: u32,
    /// Tickets whose payment is confirmed
    pub confirmed_sold: u32,
    /// When the event starts
    pub starts_at: DateTime<Utc>,
    /// Optional early-bird window
    pub early_bird: Option<EarlyBird>,
    /// Pricing rules, applied in this order
    pub rules: Vec<PricingRule>,
}

impl Event {
    /// Creates an event with nothing sold and no rules
    #[must_use]
    pub fn new(base_price: Money, capacity: u32, starts_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            base_price,
            capacity,
            confirmed_sold: 0,
            starts_at,
            early_bird: None,
            rules: Vec::new(),
        }
    }

    /// Appends a pricing rule
    #[must_use]
    pub fn with_rule(mut self, rule: PricingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Sets the early-bird window
    #[must_use]
    pub const fn with_early_bird(mut self, early_bird: EarlyBird) -> Self {
        self.early_bird = Some(early_bird);
        self
    }

    /// Sets the number of tickets already sold
    #[must_use]
    pub const fn with_confirmed_sold(mut self, confirmed_sold: u32) -> Self {
        self.confirmed_sold = confirmed_sold;
        self
    }
}

// ============================================================================
// Tickets
// ============================================================================

/// Contact details of the ticket holder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderContact {
    /// Holder name
    pub name: String,
    /// Email the ticket is delivered to
    pub email: String,
}

impl HolderContact {
    /// Creates contact details
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Ticket lifecycle state
///
/// ```text
/// Pending ──> Paid ──> CheckedIn
///    │          │
///    v          v
/// Cancelled  Refunded
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Reserved, payment not yet confirmed
    Pending,
    /// Payment confirmed, token issued
    Paid,
    /// Scanned at the venue
    CheckedIn,
    /// Reservation expired or payment failed
    Cancelled,
    /// Payment returned to the buyer
    Refunded,
}

impl TicketStatus {
    /// Stable lowercase name for logs and errors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::CheckedIn => "checked_in",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// No transition leaves a terminal state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CheckedIn | Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ticket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier
    pub id: TicketId,
    /// Event the ticket admits to
    pub event_id: EventId,
    /// Reservation the ticket was created under
    pub reservation_id: ReservationId,
    /// Holder contact details
    pub holder: HolderContact,
    /// Lifecycle state
    pub status: TicketStatus,
    /// Price fixed when the ticket was created
    pub price: Money,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When payment was confirmed
    pub paid_at: Option<DateTime<Utc>>,
    /// When the ticket was scanned
    pub checked_in_at: Option<DateTime<Utc>>,
    /// External payment reference (the gateway order id)
    pub payment_reference: Option<String>,
}

// ============================================================================
// Reservations
// ============================================================================

/// Reservation state
///
/// Monotonic: `Open` moves to exactly one of the other two and never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Holding capacity, awaiting payment
    Open,
    /// Payment confirmed, tickets issued
    Confirmed,
    /// Released without payment
    Expired,
}

impl ReservationStatus {
    /// Stable lowercase name for logs and errors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reservation was released
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Deadline passed without payment
    Timeout,
    /// Buyer abandoned checkout
    BuyerCancelled,
    /// Gateway reported a failed or voided payment
    PaymentFailed,
}

impl ExpiryReason {
    /// Stable lowercase name for logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BuyerCancelled => "buyer_cancelled",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

/// A temporary hold on capacity with a locked-in amount
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Event the capacity is held on
    pub event_id: EventId,
    /// Tickets created under this reservation
    pub ticket_ids: Vec<TicketId>,
    /// Amount due: the sum of the tickets' fixed prices
    pub amount: Money,
    /// Payment must be confirmed strictly before this instant
    pub expires_at: DateTime<Utc>,
    /// Current state
    pub status: ReservationStatus,
    /// External payment reference once confirmed
    pub payment_reference: Option<String>,
    /// Why the reservation expired, once it has
    pub expiry_reason: Option<ExpiryReason>,
}

impl Reservation {
    /// Whether the deadline has passed at `now`
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
