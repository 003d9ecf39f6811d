//! Ticket notifications.
//!
//! Delivering emails or push messages belongs to an external collaborator.
//! The ticket aggregate emits a [`TicketNotice`] as an effect after each
//! successful transition; a failed delivery is logged and dropped, never
//! surfaced to the caller that triggered the transition.

use crate::token::CheckInToken;
use crate::types::{EventId, HolderContact, Money, TicketId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Something worth telling a ticket holder about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TicketNotice {
    /// Payment confirmed; the token goes to the holder
    Issued {
        /// Ticket
        ticket_id: TicketId,
        /// Event
        event_id: EventId,
        /// Delivery address
        holder: HolderContact,
        /// Check-in credential
        token: CheckInToken,
    },
    /// Ticket scanned at the venue
    CheckedIn {
        /// Ticket
        ticket_id: TicketId,
        /// Event
        event_id: EventId,
        /// Scan time
        at: DateTime<Utc>,
    },
    /// Reservation expired or payment failed
    Cancelled {
        /// Ticket
        ticket_id: TicketId,
        /// Event
        event_id: EventId,
    },
    /// Payment returned
    Refunded {
        /// Ticket
        ticket_id: TicketId,
        /// Event
        event_id: EventId,
        /// Amount returned
        amount: Money,
    },
}

impl TicketNotice {
    /// Ticket the notice is about
    #[must_use]
    pub const fn ticket_id(&self) -> TicketId {
        match self {
            Self::Issued { ticket_id, .. }
            | Self::CheckedIn { ticket_id, .. }
            | Self::Cancelled { ticket_id, .. }
            | Self::Refunded { ticket_id, .. } => *ticket_id,
        }
    }

    /// Stable label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Issued { .. } => "issued",
            Self::CheckedIn { .. } => "checked_in",
            Self::Cancelled { .. } => "cancelled",
            Self::Refunded { .. } => "refunded",
        }
    }
}

/// Delivery failure reported by a notifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers notices to ticket holders
///
/// Returns a boxed future so the trait stays object safe.
pub trait TicketNotifier: Send + Sync {
    /// Deliver one notice
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if delivery failed.
    fn notify(
        &self,
        notice: TicketNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;
}

/// Deliver a notice and absorb any failure
pub(crate) async fn deliver(notifier: &dyn TicketNotifier, notice: TicketNotice) {
    let ticket_id = notice.ticket_id();
    let kind = notice.kind();
    if let Err(error) = notifier.notify(notice).await {
        metrics::counter!("ticketing_notifications_failed_total", "kind" => kind).increment(1);
        tracing::warn!(%ticket_id, kind, %error, "Ticket notification failed");
    }
}

/// Notifier that only writes a log line
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl TicketNotifier for LoggingNotifier {
    fn notify(
        &self,
        notice: TicketNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                ticket_id = %notice.ticket_id(),
                kind = notice.kind(),
                "Ticket notification"
            );
            Ok(())
        })
    }
}

/// In-memory notifier that records notices, for tests and demos
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<TicketNotice>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Creates an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following delivery fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notices delivered so far
    #[must_use]
    pub fn notices(&self) -> Vec<TicketNotice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TicketNotifier for RecordingNotifier {
    fn notify(
        &self,
        notice: TicketNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError("mail relay unavailable".to_string()));
            }
            self.notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(notice);
            Ok(())
        })
    }
}
