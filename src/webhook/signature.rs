//! Webhook signatures: base64 HMAC-SHA256 of the raw body, keyed with the
//! account's shared secret.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("no webhook secret configured for account {0}")]
    MissingSecret(String),
    #[error("signature is not valid base64: {0}")]
    Malformed(String),
    #[error("signature does not match payload")]
    Mismatch,
    #[error("webhook secret cannot key HMAC-SHA256")]
    InvalidSecret,
}

/// What to do with an event whose signature does not check out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePolicy {
    /// Log the failure and process the event anyway.
    #[default]
    LogAndAccept,
    Reject,
}

impl SignaturePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignaturePolicy::LogAndAccept => "log_and_accept",
            SignaturePolicy::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "log_and_accept" => Some(SignaturePolicy::LogAndAccept),
            "reject" => Some(SignaturePolicy::Reject),
            _ => None,
        }
    }
}

fn mac(secret: &str) -> Result<HmacSha256, SignatureError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)
}

pub fn sign_payload(body: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Checks `signature` against `body` in constant time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    let expected = BASE64
        .decode(signature)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}
