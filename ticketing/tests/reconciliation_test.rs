//! Payment reconciliation against the mock gateway.
//!
//! Gateways retry webhooks, deliver them out of order and sometimes in
//! parallel. These tests drive the reconciler with raw webhook bodies the way
//! a callback endpoint would.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use futures::future::join_all;
use std::sync::Arc;
use turnstile_ticketing::{
    CallbackOutcome, Event, EventId, HolderContact, LoggingNotifier, MockPaymentGateway, Money,
    OrderState, PaymentCallback, PaymentReconciler, SigningSecret, TicketLifecycle, TicketStatus,
    TicketingConfig, TicketingError,
};
use turnstile_testing::{ManualClock, SeededRandom, test_time};

struct Harness {
    gateway: MockPaymentGateway,
    lifecycle: Arc<TicketLifecycle>,
    reconciler: Arc<PaymentReconciler>,
    event_id: EventId,
}

fn harness(capacity: u32) -> Harness {
    let config = TicketingConfig::default()
        .with_signing_secret(SigningSecret::generate(&SeededRandom::new(300)));
    let lifecycle = Arc::new(TicketLifecycle::new(
        &config,
        Arc::new(ManualClock::new(test_time())),
        Arc::new(SeededRandom::new(301)),
        Arc::new(LoggingNotifier),
    ));
    let event = Event::new(
        Money::from_minor_units(3_000),
        capacity,
        test_time() + chrono::Duration::days(3),
    );
    let event_id = event.id;
    lifecycle.register_event(event).unwrap();

    let gateway = MockPaymentGateway::new();
    let reconciler = Arc::new(PaymentReconciler::new(
        Arc::clone(&lifecycle),
        Arc::new(gateway.clone()),
        "EUR",
    ));
    Harness {
        gateway,
        lifecycle,
        reconciler,
        event_id,
    }
}

fn webhook(body: &str) -> PaymentCallback {
    serde_json::from_str(body).unwrap()
}

fn holder() -> HolderContact {
    HolderContact::new("Grace Hopper", "grace@example.com")
}

/// A webhook retried in parallel confirms the order exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_webhook_retries_confirm_once() {
    let h = harness(10);
    let checkout = h.reconciler.begin_checkout(h.event_id, 2, holder()).await.unwrap();
    let body = format!(
        r#"{{"order_id":"{}","paid_amount":{},"status":"captured"}}"#,
        checkout.order_id,
        checkout.order.amount.minor_units()
    );

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let reconciler = Arc::clone(&h.reconciler);
            let callback = webhook(&body);
            tokio::spawn(async move { reconciler.handle_callback(callback).await })
        })
        .collect();

    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|handle| handle.unwrap().unwrap())
        .collect();

    let confirmed = outcomes
        .iter()
        .filter(|o| matches!(o, CallbackOutcome::Confirmed(issued) if issued.len() == 2))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, CallbackOutcome::AlreadySettled))
        .count();
    assert_eq!(confirmed, 1);
    assert_eq!(duplicates, 9);

    assert_eq!(
        h.reconciler.order_state(&checkout.order_id).await.unwrap(),
        OrderState::Settled
    );
    for ticket_id in &checkout.order.ticket_ids {
        let ticket = h.lifecycle.ticket(*ticket_id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Paid);
    }
}

/// A failed payment webhook releases the seats; its retry is a no-op.
#[tokio::test]
async fn test_failed_webhook_releases_seats() {
    let h = harness(3);
    let checkout = h.reconciler.begin_checkout(h.event_id, 3, holder()).await.unwrap();
    assert_eq!(h.lifecycle.remaining_capacity(h.event_id).await.unwrap(), 0);

    let body = format!(
        r#"{{"order_id":"{}","paid_amount":0,"status":"failed"}}"#,
        checkout.order_id
    );
    let first = h.reconciler.handle_callback(webhook(&body)).await.unwrap();
    let retry = h.reconciler.handle_callback(webhook(&body)).await.unwrap();

    assert!(matches!(first, CallbackOutcome::Closed));
    assert!(matches!(retry, CallbackOutcome::AlreadyClosed));
    assert_eq!(h.lifecycle.remaining_capacity(h.event_id).await.unwrap(), 3);
    for ticket_id in &checkout.order.ticket_ids {
        let ticket = h.lifecycle.ticket(*ticket_id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Cancelled);
    }
}

/// A client-declared amount in the webhook never settles the order.
#[tokio::test]
async fn test_underpaid_webhook_is_refused() {
    let h = harness(5);
    let checkout = h.reconciler.begin_checkout(h.event_id, 1, holder()).await.unwrap();
    let body = format!(
        r#"{{"order_id":"{}","paid_amount":1,"status":"captured"}}"#,
        checkout.order_id
    );

    let result = h.reconciler.handle_callback(webhook(&body)).await;

    assert!(matches!(result, Err(TicketingError::AmountMismatch)));
    assert_eq!(
        h.reconciler.order_state(&checkout.order_id).await.unwrap(),
        OrderState::AwaitingPayment
    );
}

/// The gateway only ever sees the server-computed amount.
#[tokio::test]
async fn test_gateway_orders_carry_server_amounts() {
    let h = harness(10);
    let first = h.reconciler.begin_checkout(h.event_id, 1, holder()).await.unwrap();
    let second = h.reconciler.begin_checkout(h.event_id, 4, holder()).await.unwrap();

    let orders = h.gateway.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].order_id, first.order_id);
    assert_eq!(orders[0].amount, Money::from_minor_units(3_000));
    assert_eq!(orders[1].order_id, second.order_id);
    assert_eq!(orders[1].amount, Money::from_minor_units(12_000));
    assert!(orders.iter().all(|order| order.currency == "EUR"));
}

/// A gateway refund failure leaves the ticket refunded and the error visible.
#[tokio::test]
async fn test_refund_survives_gateway_outage() {
    let h = harness(2);
    let checkout = h.reconciler.begin_checkout(h.event_id, 1, holder()).await.unwrap();
    let body = format!(
        r#"{{"order_id":"{}","paid_amount":{},"status":"captured"}}"#,
        checkout.order_id,
        checkout.order.amount.minor_units()
    );
    h.reconciler.handle_callback(webhook(&body)).await.unwrap();
    let ticket_id = checkout.order.ticket_ids[0];

    h.gateway.set_failing(true);
    let result = h.reconciler.refund_ticket(ticket_id).await;

    assert!(matches!(result, Err(TicketingError::PaymentGateway(_))));
    let ticket = h.lifecycle.ticket(ticket_id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Refunded);
    assert!(h.gateway.refunds().is_empty());
    assert_eq!(h.lifecycle.remaining_capacity(h.event_id).await.unwrap(), 2);
}
