//! Configuration management for Turnstile.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Configuration is passed explicitly to constructors; nothing reads the
//! environment after startup.

use crate::token::SigningSecret;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ticketing core configuration
    pub ticketing: TicketingConfig,
    /// Process-level configuration
    pub server: ServerConfig,
}

/// Ticketing core configuration
#[derive(Debug, Clone)]
pub struct TicketingConfig {
    /// HMAC key for check-in tokens; `None` disables issuance and check-in
    pub signing_secret: Option<SigningSecret>,
    /// ISO 4217 currency all prices are expressed in
    pub currency: String,
    /// How long a reservation holds capacity awaiting payment
    pub reservation_ttl: Duration,
    /// How often the sweeper looks for expired reservations
    pub sweep_interval: Duration,
    /// Largest number of tickets in one order
    pub max_tickets_per_order: u32,
    /// Base URL printed into ticket QR codes
    pub base_url: String,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            currency: "USD".to_string(),
            reservation_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
            max_tickets_per_order: 8,
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl TicketingConfig {
    /// Longest hold a reservation may place on capacity
    pub const MAX_RESERVATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Same configuration with `secret` installed
    #[must_use]
    pub fn with_signing_secret(mut self, secret: SigningSecret) -> Self {
        self.signing_secret = Some(secret);
        self
    }

    /// Same configuration with a different reservation lifetime
    #[must_use]
    pub const fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }
}

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Log filter (trace, debug, info, warn, error)
    pub log_level: String,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Invalid configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Currency is not a three-letter uppercase code
    #[error("Currency must be a three-letter ISO 4217 code, got {0:?}")]
    InvalidCurrency(String),

    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Reservation TTL above [`TicketingConfig::MAX_RESERVATION_TTL`]
    #[error("Reservation TTL must be at most {max_secs}s, got {actual_secs}s")]
    ReservationTtlTooLong {
        /// Upper bound in seconds
        max_secs: u64,
        /// Configured value in seconds
        actual_secs: u64,
    },

    /// Orders must allow at least one ticket
    #[error("Maximum tickets per order must be at least 1")]
    ZeroOrderLimit,

    /// Base URL is not http(s)
    #[error("Base URL must start with http:// or https://, got {0:?}")]
    InvalidBaseUrl(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A missing or unusable `TURNSTILE_SIGNING_SECRET` leaves the token
    /// service unconfigured: tickets cannot be issued and every check-in is
    /// refused.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = TicketingConfig::default();

        Self {
            ticketing: TicketingConfig {
                signing_secret: load_signing_secret(),
                currency: env::var("TURNSTILE_CURRENCY").unwrap_or(defaults.currency),
                reservation_ttl: Duration::from_secs(env_or("TURNSTILE_RESERVATION_TTL_SECS", 300)),
                sweep_interval: Duration::from_secs(env_or("TURNSTILE_SWEEP_INTERVAL_SECS", 15)),
                max_tickets_per_order: env_or(
                    "TURNSTILE_MAX_TICKETS_PER_ORDER",
                    defaults.max_tickets_per_order,
                ),
                base_url: env::var("TURNSTILE_BASE_URL").unwrap_or(defaults.base_url),
            },
            server: ServerConfig {
                log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
                metrics_host: env::var("METRICS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                metrics_port: env_or("METRICS_PORT", 9090),
                shutdown_timeout: env_or("SHUTDOWN_TIMEOUT", 30),
            },
        }
    }

    /// Check values that parsed but make no sense
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ticketing = &self.ticketing;

        let currency = &ticketing.currency;
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ConfigError::InvalidCurrency(currency.clone()));
        }
        if ticketing.reservation_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("Reservation TTL"));
        }
        if ticketing.reservation_ttl > TicketingConfig::MAX_RESERVATION_TTL {
            return Err(ConfigError::ReservationTtlTooLong {
                max_secs: TicketingConfig::MAX_RESERVATION_TTL.as_secs(),
                actual_secs: ticketing.reservation_ttl.as_secs(),
            });
        }
        if ticketing.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("Sweep interval"));
        }
        if ticketing.max_tickets_per_order == 0 {
            return Err(ConfigError::ZeroOrderLimit);
        }
        if !(ticketing.base_url.starts_with("http://") || ticketing.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(ticketing.base_url.clone()));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn load_signing_secret() -> Option<SigningSecret> {
    let Ok(encoded) = env::var("TURNSTILE_SIGNING_SECRET") else {
        tracing::warn!("TURNSTILE_SIGNING_SECRET is not set; ticket issuance and check-in are disabled");
        return None;
    };
    match SigningSecret::from_base64(&encoded) {
        Ok(secret) => Some(secret),
        Err(error) => {
            tracing::error!(%error, "TURNSTILE_SIGNING_SECRET rejected; ticket issuance and check-in are disabled");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            ticketing: TicketingConfig::default(),
            server: ServerConfig {
                log_level: "info".to_string(),
                metrics_host: "127.0.0.1".to_string(),
                metrics_port: 9090,
                shutdown_timeout: 30,
            },
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.ticketing.reservation_ttl, Duration::from_secs(300));
        assert_eq!(config.ticketing.max_tickets_per_order, 8);
        assert!(config.ticketing.signing_secret.is_none());
    }

    #[test]
    fn test_validation_catches_nonsense() {
        let mut bad_currency = config();
        bad_currency.ticketing.currency = "usd".to_string();
        assert_eq!(
            bad_currency.validate(),
            Err(ConfigError::InvalidCurrency("usd".to_string()))
        );

        let mut no_ttl = config();
        no_ttl.ticketing.reservation_ttl = Duration::ZERO;
        assert_eq!(no_ttl.validate(), Err(ConfigError::ZeroDuration("Reservation TTL")));

        let mut endless_ttl = config();
        endless_ttl.ticketing.reservation_ttl = Duration::from_secs(9_000_000_000_000_000);
        assert_eq!(
            endless_ttl.validate(),
            Err(ConfigError::ReservationTtlTooLong {
                max_secs: 86_400,
                actual_secs: 9_000_000_000_000_000,
            })
        );

        let mut day_ttl = config();
        day_ttl.ticketing.reservation_ttl = TicketingConfig::MAX_RESERVATION_TTL;
        assert_eq!(day_ttl.validate(), Ok(()));

        let mut no_tickets = config();
        no_tickets.ticketing.max_tickets_per_order = 0;
        assert_eq!(no_tickets.validate(), Err(ConfigError::ZeroOrderLimit));

        let mut bad_url = config();
        bad_url.ticketing.base_url = "tickets.example.com".to_string();
        assert!(matches!(bad_url.validate(), Err(ConfigError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = SigningSecret::new(vec![42; 32]).ok();
        let mut config = config();
        config.ticketing.signing_secret = secret.clone();
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&secret.map(|s| s.to_base64()).unwrap_or_default()));
    }
}
