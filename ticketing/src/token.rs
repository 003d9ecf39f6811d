//! Check-in tokens.
//!
//! A token is `base64url(HMAC-SHA256(secret, "turnstile.checkin.v1:" || ticket_id))`
//! without padding: 43 printable characters that survive QR codes and URL
//! query strings unescaped. Tokens are never stored; verification recomputes
//! the expected value from the ticket id and the deployment secret.
//!
//! Verification fails closed. A malformed token, a token of the wrong length
//! and a service without a secret all verify as `false`.

use crate::types::TicketId;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use turnstile_core::environment::RandomSource;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation prefix; bump the version to invalidate every token
const TOKEN_DOMAIN: &[u8] = b"turnstile.checkin.v1:";

/// Length of an encoded token
pub const TOKEN_LEN: usize = 43;

/// Errors from token issuance and secret handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Secret has less than 256 bits
    #[error("Signing secret must be at least {min} bytes, got {actual}")]
    SecretTooShort {
        /// Minimum length in bytes
        min: usize,
        /// Length supplied
        actual: usize,
    },

    /// Secret is not valid base64
    #[error("Signing secret is not valid base64")]
    InvalidEncoding,

    /// No secret configured
    #[error("Signing secret is not configured")]
    Unconfigured,
}

/// Server-held HMAC key
///
/// `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    /// Minimum key length (256 bits)
    pub const MIN_LEN: usize = 32;

    /// Wrap raw key bytes
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SecretTooShort`] for keys under [`Self::MIN_LEN`] bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, TokenError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(TokenError::SecretTooShort {
                min: Self::MIN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    /// Decode a base64 secret (standard or URL-safe alphabet, padded or not)
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidEncoding`] if no alphabet decodes the
    /// input, or [`TokenError::SecretTooShort`] if the key is too short.
    pub fn from_base64(encoded: &str) -> Result<Self, TokenError> {
        let encoded = encoded.trim();
        let bytes = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .map_err(|_| TokenError::InvalidEncoding)?;
        Self::new(bytes)
    }

    /// Fresh random secret
    #[must_use]
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = vec![0u8; Self::MIN_LEN];
        random.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Base64 (standard alphabet) encoding, for provisioning
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// A signed check-in credential for one ticket
///
/// `Debug` is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct CheckInToken(String);

impl CheckInToken {
    /// The encoded token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the encoded string
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for CheckInToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CheckInToken(<redacted>)")
    }
}

/// Signs and verifies check-in tokens
#[derive(Clone, Debug)]
pub struct TokenService {
    secret: Option<Arc<SigningSecret>>,
}

impl TokenService {
    /// Service signing with `secret`
    #[must_use]
    pub fn new(secret: SigningSecret) -> Self {
        Self {
            secret: Some(Arc::new(secret)),
        }
    }

    /// Service without a secret: signing fails and every token is rejected
    #[must_use]
    pub const fn unconfigured() -> Self {
        Self { secret: None }
    }

    /// Service from optional configuration
    #[must_use]
    pub fn from_secret(secret: Option<SigningSecret>) -> Self {
        secret.map_or_else(Self::unconfigured, Self::new)
    }

    /// Whether a secret is configured
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Issue the token for `ticket_id`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Unconfigured`] when no secret is set.
    pub fn sign(&self, ticket_id: TicketId) -> Result<CheckInToken, TokenError> {
        self.expected(ticket_id)
            .map(CheckInToken)
            .ok_or(TokenError::Unconfigured)
    }

    /// Check `token` against `ticket_id`
    ///
    /// The final comparison takes the same time wherever the first differing
    /// byte is.
    #[must_use]
    pub fn verify(&self, ticket_id: TicketId, token: &str) -> bool {
        if !is_well_formed(token) {
            return false;
        }
        let Some(expected) = self.expected(ticket_id) else {
            return false;
        };
        // constant_time_eq reads every byte of equal-length inputs without branching
        constant_time_eq::constant_time_eq(expected.as_bytes(), token.as_bytes())
    }

    fn expected(&self, ticket_id: TicketId) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(&secret.0).ok()?;
        mac.update(TOKEN_DOMAIN);
        mac.update(ticket_id.as_uuid().as_bytes());
        Some(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

/// Length and alphabet check; says nothing about authenticity
fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Contents of the QR code printed on a ticket
///
/// Renders as `<base-url>/ticket/<ticket-id>?token=<token>`.
#[derive(Clone, PartialEq, Eq)]
pub struct ScanPayload {
    /// Ticket being presented
    pub ticket_id: TicketId,
    /// Token presented with it
    pub token: String,
}

impl ScanPayload {
    /// Payload for an issued ticket
    #[must_use]
    pub fn new(ticket_id: TicketId, token: &CheckInToken) -> Self {
        Self {
            ticket_id,
            token: token.as_str().to_string(),
        }
    }

    /// Render as a URL under `base_url`
    #[must_use]
    pub fn to_url(&self, base_url: &str) -> String {
        format!(
            "{}/ticket/{}?token={}",
            base_url.trim_end_matches('/'),
            self.ticket_id,
            self.token
        )
    }

    /// Parse a scanned URL
    ///
    /// Strict: anything other than exactly one ticket id and one well-formed
    /// token parameter yields `None`. The base URL is not checked.
    #[must_use]
    pub fn parse(url: &str) -> Option<Self> {
        let (_, rest) = url.rsplit_once("/ticket/")?;
        let (id, query) = rest.split_once("?token=")?;
        if !is_well_formed(query) {
            return None;
        }
        let ticket_id = id.parse().ok()?;
        Some(Self {
            ticket_id,
            token: query.to_string(),
        })
    }
}

impl fmt::Debug for ScanPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPayload")
            .field("ticket_id", &self.ticket_id)
            .field("token", &"<redacted>")
            .finish()
    }
}
