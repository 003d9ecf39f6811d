//! Turnstile demo
//!
//! Walks one order through the whole flow against the mock payment gateway:
//! - Event registration with a demand-based pricing rule
//! - Checkout (reservation + gateway order for the server-computed amount)
//! - Captured payment callback, then a duplicate of it
//! - Check-in, a re-scan, and a tampered token
//! - Refund
//!
//! # Usage
//!
//! ```bash
//! # Optional: a stable signing secret (base64, at least 32 bytes)
//! export TURNSTILE_SIGNING_SECRET=$(openssl rand -base64 32)
//!
//! cargo run --bin demo
//! ```
//!
//! Metrics are served for Prometheus at `http://<METRICS_HOST>:<METRICS_PORT>/metrics`.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_core::environment::{OsRandom, SystemClock};
use turnstile_ticketing::{
    AdjustmentKind, CallbackOutcome, Config, Event, HolderContact, LoggingNotifier,
    MockPaymentGateway, Money, PaymentCallback, PaymentReconciler, PaymentStatus, PricingRule,
    ReservationSweeper, RuleId, SigningSecret, TicketLifecycle, TriggerKind,
    metrics::register_business_metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let mut config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,turnstile_ticketing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("invalid configuration")?;

    let metrics_addr: SocketAddr = format!(
        "{}:{}",
        config.server.metrics_host, config.server.metrics_port
    )
    .parse()
    .context("invalid metrics address")?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    register_business_metrics();
    tracing::info!(%metrics_addr, "Prometheus metrics available");

    if config.ticketing.signing_secret.is_none() {
        tracing::warn!("Using an ephemeral signing secret; tickets will not verify after restart");
        config.ticketing.signing_secret = Some(SigningSecret::generate(&OsRandom));
    }

    let clock = Arc::new(SystemClock);
    let lifecycle = Arc::new(TicketLifecycle::new(
        &config.ticketing,
        clock,
        Arc::new(OsRandom),
        Arc::new(LoggingNotifier),
    ));
    let gateway = Arc::new(MockPaymentGateway::new());
    let reconciler = PaymentReconciler::new(
        Arc::clone(&lifecycle),
        gateway,
        config.ticketing.currency.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = ReservationSweeper::new(Arc::clone(&lifecycle), config.ticketing.sweep_interval)
        .spawn(shutdown_rx);

    // ========== Demo Scenario ==========

    let event = Event::new(
        Money::from_minor_units(10_000),
        10,
        chrono::Utc::now() + chrono::Duration::days(14),
    )
    .with_confirmed_sold(6)
    .with_rule(PricingRule::new(
        RuleId(1),
        TriggerKind::DemandPercent,
        50,
        AdjustmentKind::Percentage,
        10,
    ));
    let event_id = event.id;
    lifecycle.register_event(event)?;
    tracing::info!(%event_id, "Step 1: event registered (capacity 10, 6 sold, +10% above 50% sold)");

    let checkout = reconciler
        .begin_checkout(event_id, 2, HolderContact::new("Ada Lovelace", "ada@example.com"))
        .await?;
    tracing::info!(
        order_id = %checkout.order_id,
        unit_price = %checkout.order.unit_price,
        amount = %checkout.order.amount,
        remaining = lifecycle.remaining_capacity(event_id).await?,
        "Step 2: checkout started"
    );

    let captured = PaymentCallback {
        order_id: checkout.order_id.clone(),
        paid_amount: checkout.order.amount,
        status: PaymentStatus::Captured,
    };
    let CallbackOutcome::Confirmed(issued) = reconciler.handle_callback(captured.clone()).await?
    else {
        anyhow::bail!("capture did not confirm the order");
    };
    for ticket in &issued {
        tracing::info!(ticket_id = %ticket.ticket.id, scan_url = %ticket.scan_url, "Step 3: ticket issued");
    }

    let duplicate = reconciler.handle_callback(captured).await?;
    tracing::info!(?duplicate, "Step 4: duplicate capture ignored");

    let first = issued.first().context("no ticket issued")?;
    let admitted = lifecycle.check_in_scan(&first.scan_url).await?;
    tracing::info!(ticket_id = %admitted.id, "Step 5: checked in");

    match lifecycle.check_in_scan(&first.scan_url).await {
        Err(error) => tracing::info!(message = %error.public_message(), "Step 6: re-scan refused"),
        Ok(_) => anyhow::bail!("re-scan was admitted"),
    }

    if let Some(second) = issued.get(1) {
        let mut forged = second.token.as_str().to_string();
        forged.replace_range(0..1, if forged.starts_with('A') { "B" } else { "A" });
        match lifecycle.check_in(second.ticket.id, &forged).await {
            Err(error) => {
                tracing::info!(message = %error.public_message(), "Step 7: tampered token refused");
            },
            Ok(_) => anyhow::bail!("tampered token was admitted"),
        }

        let receipt = reconciler.refund_ticket(second.ticket.id).await?;
        tracing::info!(
            ticket_id = %receipt.ticket.id,
            refund = %receipt.refund_reference,
            remaining = lifecycle.remaining_capacity(event_id).await?,
            "Step 8: ticket refunded"
        );
    }

    // ========== Shutdown ==========

    lifecycle
        .settle(Duration::from_secs(config.server.shutdown_timeout))
        .await?;
    let _ = shutdown_tx.send(true);
    sweeper.await?;

    tracing::info!("Demo complete");
    Ok(())
}
