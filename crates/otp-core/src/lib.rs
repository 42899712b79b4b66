//! Core value types for the OpenTransit poller: canonical JSON + content fingerprints.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "otp-core";

/// Decoded provider response. Any JSON shape is valid.
pub type RawDocument = JsonValue;

/// Sub-value selected from a [`RawDocument`] by the projection expression.
pub type Projection = JsonValue;

/// Hex width of a [`Fingerprint`] (SHA-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Serialize `value` as compact JSON with object keys in sorted order.
///
/// Two values that compare equal always produce the same bytes, regardless of
/// how their object keys were ordered when they were built or decoded.
pub fn canonical_json_bytes(value: &JsonValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut Vec<u8>) {
    match value {
        JsonValue::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push(b'{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(JsonValue::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Content-derived identity of a projection; doubles as the stored object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Accepts only lowercase hex of the expected width.
    pub fn parse(input: &str) -> Option<Self> {
        let valid = input.len() == FINGERPRINT_HEX_LEN
            && input
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical bytes of a projection paired with their fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintedPayload {
    pub key: Fingerprint,
    pub bytes: Vec<u8>,
}

impl FingerprintedPayload {
    pub fn from_projection(projection: &Projection) -> Self {
        let bytes = canonical_json_bytes(projection);
        Self {
            key: Fingerprint::of_bytes(&bytes),
            bytes,
        }
    }
}

pub fn fingerprint(projection: &Projection) -> Fingerprint {
    FingerprintedPayload::from_projection(projection).key
}

/// Stage of a single poll cycle, used to tag failures and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Fetching,
    Projecting,
    Fingerprinting,
    CheckingExistence,
    Writing,
    Skipped,
    Done,
}

impl CycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStage::Fetching => "fetching",
            CycleStage::Projecting => "projecting",
            CycleStage::Fingerprinting => "fingerprinting",
            CycleStage::CheckingExistence => "checking_existence",
            CycleStage::Writing => "writing",
            CycleStage::Skipped => "skipped",
            CycleStage::Done => "done",
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a poll cycle that reached [`CycleStage::Done`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub key: Fingerprint,
    pub bytes: usize,
    pub written: bool,
}
