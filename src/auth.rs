use axum::http::HeaderMap;
use hex::decode;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "x-cloud-update-signature";
pub const SIGNATURE_PREFIX: &str = "sha256=";
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(300);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum AuthError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("request timestamp outside the accepted window")]
    StaleRequest,
    #[error("request body has no usable timestamp")]
    BadPayload,
    #[error("webhook secret must not be empty")]
    EmptySecret,
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::MalformedSignature => "malformed_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::StaleRequest => "stale_request",
            Self::BadPayload => "bad_payload",
            Self::EmptySecret => "empty_secret",
        }
    }
}

#[derive(Deserialize)]
struct TimestampOnly {
    timestamp: i64,
}

/// Verifies `X-Cloud-Update-Signature` and the body timestamp.
///
/// The keyed HMAC state is built once; each request clones it and only
/// hashes the body.
pub struct Authenticator {
    mac: HmacSha256,
    max_skew: Duration,
}

impl Authenticator {
    pub fn new(secret: &[u8], max_skew: Duration) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::EmptySecret)?;
        Ok(Self { mac, max_skew })
    }

    pub fn authenticate(&self, body: &[u8], headers: &HeaderMap) -> Result<(), AuthError> {
        let now = i64::try_from(crate::current_unix_secs()).unwrap_or(i64::MAX);
        self.authenticate_at(body, headers, now)
    }

    pub fn authenticate_at(
        &self,
        body: &[u8],
        headers: &HeaderMap,
        now: i64,
    ) -> Result<(), AuthError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .ok_or(AuthError::MissingSignature)?
            .to_str()
            .map_err(|_| AuthError::MalformedSignature)?;
        let hex_part = signature
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(AuthError::MalformedSignature)?;
        let provided = decode(hex_part).map_err(|_| AuthError::MalformedSignature)?;

        let mut mac = self.mac.clone();
        mac.update(body);
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(&provided)) {
            return Err(AuthError::InvalidSignature);
        }

        let payload: TimestampOnly =
            serde_json::from_slice(body).map_err(|_| AuthError::BadPayload)?;
        let skew = now.abs_diff(payload.timestamp);
        if skew > self.max_skew.as_secs() {
            return Err(AuthError::StaleRequest);
        }
        Ok(())
    }
}

/// Client-side helper: the header value for `body` signed with `secret`.
#[cfg(test)]
pub(crate) fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return SIGNATURE_PREFIX.to_string(),
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
