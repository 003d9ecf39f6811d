//! Background expiry of unpaid reservations.
//!
//! The sweeper never blocks a request: it runs on its own task, looks up the
//! reservations past their deadline and releases them one at a time through
//! the same reservation stores request handlers use. A payment confirmation
//! racing the sweep is decided by whichever reaches the reservation first.

use crate::error::TicketingError;
use crate::lifecycle::TicketLifecycle;
use crate::types::ExpiryReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Periodically expires reservations whose deadline has passed
pub struct ReservationSweeper {
    lifecycle: Arc<TicketLifecycle>,
    interval: Duration,
}

impl ReservationSweeper {
    /// Creates a sweeper running every `interval`
    #[must_use]
    pub const fn new(lifecycle: Arc<TicketLifecycle>, interval: Duration) -> Self {
        Self {
            lifecycle,
            interval,
        }
    }

    /// Expire every open reservation past its deadline
    ///
    /// Returns how many reservations this pass released.
    pub async fn sweep_once(&self) -> usize {
        let now = self.lifecycle.clock().now();
        let due = self.lifecycle.open_reservations_due(now);

        let mut expired = 0;
        for reservation_id in due {
            match self
                .lifecycle
                .close_reservation(reservation_id, ExpiryReason::Timeout)
                .await
            {
                Ok(_) => expired += 1,
                Err(TicketingError::InvalidStateTransition { state, .. }) => {
                    debug!(%reservation_id, state, "Reservation settled before the sweep reached it");
                },
                Err(error) => {
                    error!(%reservation_id, %error, "Failed to expire reservation");
                },
            }
        }

        if expired > 0 {
            info!(expired, "Expired unpaid reservations");
        }
        expired
    }

    /// Sweep on every tick until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Reservation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reservation sweeper stopped");
    }

    /// Run on a background task
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TicketingConfig;
    use crate::lifecycle::PaymentConfirmation;
    use crate::notifier::LoggingNotifier;
    use crate::token::SigningSecret;
    use crate::types::{Event, HolderContact, Money, ReservationStatus, TicketStatus};
    use turnstile_testing::{ManualClock, SeededRandom, test_time};

    fn setup() -> (Arc<ManualClock>, Arc<TicketLifecycle>, crate::types::EventId) {
        let clock = Arc::new(ManualClock::new(test_time()));
        let config = TicketingConfig::default()
            .with_signing_secret(SigningSecret::generate(&SeededRandom::new(21)));
        let lifecycle = Arc::new(TicketLifecycle::new(
            &config,
            clock.clone(),
            Arc::new(SeededRandom::new(22)),
            Arc::new(LoggingNotifier),
        ));
        let event = Event::new(
            Money::from_minor_units(2_000),
            4,
            test_time() + chrono::Duration::days(2),
        );
        let event_id = event.id;
        lifecycle.register_event(event).unwrap();
        (clock, lifecycle, event_id)
    }

    #[tokio::test]
    async fn test_sweep_releases_only_overdue_reservations() {
        let (clock, lifecycle, event_id) = setup();
        let holder = HolderContact::new("Ken", "ken@example.com");
        let early = lifecycle.create(event_id, 2, holder.clone()).await.unwrap();

        clock.advance(chrono::Duration::minutes(3));
        let later = lifecycle.create(event_id, 1, holder).await.unwrap();

        clock.advance(chrono::Duration::minutes(2));
        let sweeper = ReservationSweeper::new(Arc::clone(&lifecycle), Duration::from_secs(15));
        assert_eq!(sweeper.sweep_once().await, 1);

        let early_state = lifecycle.reservation(early.reservation_id).await.unwrap();
        assert_eq!(early_state.status, ReservationStatus::Expired);
        let later_state = lifecycle.reservation(later.reservation_id).await.unwrap();
        assert_eq!(later_state.status, ReservationStatus::Open);
        assert_eq!(lifecycle.remaining_capacity(event_id).await.unwrap(), 3);

        for ticket_id in &early.ticket_ids {
            let ticket = lifecycle.ticket(*ticket_id).await.unwrap();
            assert_eq!(ticket.status, TicketStatus::Cancelled);
        }

        assert_eq!(sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn test_payment_after_sweep_is_refused() {
        let (clock, lifecycle, event_id) = setup();
        let order = lifecycle
            .create(event_id, 1, HolderContact::new("Ken", "ken@example.com"))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(5) + chrono::Duration::seconds(1));
        let sweeper = ReservationSweeper::new(Arc::clone(&lifecycle), Duration::from_secs(15));
        assert_eq!(sweeper.sweep_once().await, 1);

        let result = lifecycle
            .confirm_payment(
                &order.ticket_ids,
                PaymentConfirmation {
                    payment_reference: "late".to_string(),
                    paid_amount: order.amount,
                },
            )
            .await;

        assert_eq!(
            result,
            Err(TicketingError::InvalidStateTransition {
                state: "expired",
                attempted: "confirm"
            })
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_clock, lifecycle, _event_id) = setup();
        let (tx, rx) = watch::channel(false);
        let handle = ReservationSweeper::new(lifecycle, Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
