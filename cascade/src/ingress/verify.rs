//! Webhook authenticity checks
//!
//! Verification runs before anything touches the ledger; an unverified
//! request never produces a side effect.

use std::collections::BTreeMap;
use std::time::Duration;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::SharedClock;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Missing header: {0}")]
    MissingHeader(String),

    #[error("Malformed header {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("Signature mismatch")]
    BadSignature,

    #[error("Timestamp outside tolerance window")]
    Stale,

    #[error("Verifier misconfigured: {0}")]
    Config(String),
}

/// A raw inbound webhook: headers plus the exact body bytes
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a header; names are case-insensitive
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<&str, VerifyError> {
        self.header(name)
            .ok_or_else(|| VerifyError::MissingHeader(name.to_string()))
    }
}

pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, request: &WebhookRequest) -> Result<(), VerifyError>;
}

/// Static shared secret carried in a header
pub struct SharedSecretVerifier {
    header: String,
    expected_tag: Vec<u8>,
    key: Vec<u8>,
}

impl SharedSecretVerifier {
    pub fn new(header: impl Into<String>, secret: &str) -> Result<Self, VerifyError> {
        if secret.is_empty() {
            return Err(VerifyError::Config("shared secret is empty".into()));
        }
        // Both sides are compared as MACs so the check runs in constant time
        let key = secret.as_bytes().to_vec();
        let expected_tag = tag(&key, secret.as_bytes())?;
        Ok(Self {
            header: header.into(),
            expected_tag,
            key,
        })
    }
}

fn tag(key: &[u8], data: &[u8]) -> Result<Vec<u8>, VerifyError> {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key).map_err(|e| VerifyError::Config(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl WebhookVerifier for SharedSecretVerifier {
    fn verify(&self, request: &WebhookRequest) -> Result<(), VerifyError> {
        let presented = request.require(&self.header)?;
        let mut mac =
            <HmacSha256 as KeyInit>::new_from_slice(&self.key).map_err(|e| VerifyError::Config(e.to_string()))?;
        mac.update(presented.as_bytes());
        mac.verify_slice(&self.expected_tag)
            .map_err(|_| VerifyError::BadSignature)
    }
}

/// HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded
pub struct HmacVerifier {
    secret: Vec<u8>,
    signature_header: String,
    timestamp_header: String,
    tolerance: Duration,
    clock: SharedClock,
}

impl HmacVerifier {
    pub const DEFAULT_SIGNATURE_HEADER: &'static str = "x-cascade-signature";
    pub const DEFAULT_TIMESTAMP_HEADER: &'static str = "x-cascade-timestamp";

    pub fn new(secret: &str, clock: SharedClock) -> Result<Self, VerifyError> {
        if secret.is_empty() {
            return Err(VerifyError::Config("hmac secret is empty".into()));
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            signature_header: Self::DEFAULT_SIGNATURE_HEADER.into(),
            timestamp_header: Self::DEFAULT_TIMESTAMP_HEADER.into(),
            tolerance: Duration::from_secs(300),
            clock,
        })
    }

    pub fn with_headers(mut self, signature: impl Into<String>, timestamp: impl Into<String>) -> Self {
        self.signature_header = signature.into();
        self.timestamp_header = timestamp.into();
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Hex signature a sender attaches for `timestamp` and `body`
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, VerifyError> {
    let mut mac =
        <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes()).map_err(|e| VerifyError::Config(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl WebhookVerifier for HmacVerifier {
    fn verify(&self, request: &WebhookRequest) -> Result<(), VerifyError> {
        let raw_ts = request.require(&self.timestamp_header)?;
        let timestamp: i64 = raw_ts.trim().parse().map_err(|_| VerifyError::Malformed {
            name: self.timestamp_header.clone(),
            reason: "not a unix timestamp".into(),
        })?;
        let skew = (self.clock.now().timestamp() - timestamp).unsigned_abs();
        if skew > self.tolerance.as_secs() {
            return Err(VerifyError::Stale);
        }

        let signature = hex::decode(request.require(&self.signature_header)?.trim()).map_err(|e| {
            VerifyError::Malformed {
                name: self.signature_header.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut mac =
            <HmacSha256 as KeyInit>::new_from_slice(&self.secret).map_err(|e| VerifyError::Config(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(&request.body);
        mac.verify_slice(&signature).map_err(|_| VerifyError::BadSignature)
    }
}
