//! Business metrics for Turnstile.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `ticketing_reservations_total{status}` - Reservations by status (created, confirmed, expired)
//! - `ticketing_capacity_rejections_total` - Reservations refused for lack of capacity
//! - `ticketing_payments_total{status}` - Payment callbacks by outcome
//! - `ticketing_payment_revenue_minor_units_total` - Confirmed revenue in minor units
//! - `ticketing_payment_refunds_minor_units_total` - Refunded amount in minor units
//! - `ticketing_tickets_sold_total` - Tickets whose payment was confirmed
//! - `ticketing_check_ins_total{outcome}` - Check-in attempts by outcome
//! - `ticketing_security_rejections_total{kind}` - Forged tokens and mismatched payments
//! - `ticketing_notifications_failed_total{kind}` - Notices that could not be delivered
//!
//! ## Gauges
//! - `ticketing_remaining_capacity{event_id}` - Tickets still available per event
//!
//! ## Histograms
//! - `ticketing_reservation_duration_seconds` - Time from checkout to confirmed payment

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Initialize and register all business metrics descriptions.
///
/// Call once at startup, before any metric is recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "ticketing_reservations_total",
        "Total number of reservations by status (created, confirmed, expired)"
    );
    describe_counter!(
        "ticketing_capacity_rejections_total",
        "Reservations refused because the event had too few tickets left"
    );
    describe_histogram!(
        "ticketing_reservation_duration_seconds",
        "Time from reservation creation to confirmed payment"
    );

    describe_counter!(
        "ticketing_payments_total",
        "Payment outcomes (confirmed, failed, duplicate, rejected, refunded)"
    );
    describe_counter!(
        "ticketing_payment_revenue_minor_units_total",
        "Revenue from confirmed payments in minor currency units"
    );
    describe_counter!(
        "ticketing_payment_refunds_minor_units_total",
        "Refunds issued in minor currency units"
    );
    describe_counter!("ticketing_tickets_sold_total", "Total number of tickets sold");

    describe_counter!(
        "ticketing_check_ins_total",
        "Check-in attempts by outcome (admitted, already_checked_in, rejected)"
    );
    describe_counter!(
        "ticketing_security_rejections_total",
        "Requests rejected as potential fraud (invalid token, amount mismatch)"
    );
    describe_counter!(
        "ticketing_notifications_failed_total",
        "Holder notifications that could not be delivered"
    );

    describe_gauge!(
        "ticketing_remaining_capacity",
        "Tickets still available per event"
    );

    tracing::info!("Business metrics registered");
}

/// Record a new reservation
pub fn record_reservation_created() {
    metrics::counter!("ticketing_reservations_total", "status" => "created").increment(1);
}

/// Record a confirmed reservation and the revenue it brought
pub fn record_reservation_confirmed(quantity: u32, amount_minor_units: u64, duration_secs: f64) {
    metrics::counter!("ticketing_reservations_total", "status" => "confirmed").increment(1);
    metrics::counter!("ticketing_tickets_sold_total").increment(u64::from(quantity));
    metrics::counter!("ticketing_payment_revenue_minor_units_total").increment(amount_minor_units);
    metrics::histogram!("ticketing_reservation_duration_seconds").record(duration_secs);
}

/// Record a reservation released without payment
pub fn record_reservation_expired(reason: &'static str) {
    metrics::counter!("ticketing_reservations_total", "status" => "expired", "reason" => reason)
        .increment(1);
}

/// Record a reservation refused for lack of capacity
pub fn record_capacity_rejection() {
    metrics::counter!("ticketing_capacity_rejections_total").increment(1);
}

/// Record the outcome of a payment callback
pub fn record_payment(status: &'static str) {
    metrics::counter!("ticketing_payments_total", "status" => status).increment(1);
}

/// Record a refund
pub fn record_refund(amount_minor_units: u64) {
    metrics::counter!("ticketing_payments_total", "status" => "refunded").increment(1);
    metrics::counter!("ticketing_payment_refunds_minor_units_total").increment(amount_minor_units);
}

/// Record a check-in attempt
pub fn record_check_in(outcome: &'static str) {
    metrics::counter!("ticketing_check_ins_total", "outcome" => outcome).increment(1);
}

/// Record a request rejected as potential fraud
pub fn record_security_rejection(kind: &'static str) {
    metrics::counter!("ticketing_security_rejections_total", "kind" => kind).increment(1);
}

/// Update the remaining-capacity gauge for an event
pub fn update_remaining_capacity(event_id: &str, remaining: u32) {
    metrics::gauge!("ticketing_remaining_capacity", "event_id" => event_id.to_string())
        .set(f64::from(remaining));
}
