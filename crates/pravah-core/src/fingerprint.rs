//! Job fingerprinting.
//!
//! A fingerprint is a SHA-256 over the input object's identity (ETag or
//! content hash), the canonicalized pipeline JSON, and the engine version
//! tag. Identical jobs hash identically, which is what makes the result
//! cache and concurrent-run deduplication sound.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::spec::PipelineSpec;

/// 256-bit job identity; the cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint of one job: input identity + canonical pipeline + engine version.
    ///
    /// `input_identity` should be the object's ETag; callers without an ETag
    /// may substitute any stable content identity (e.g. `size:mtime`).
    pub fn compute(input_identity: &str, pipeline: &PipelineSpec, engine_version: &str) -> Self {
        let canonical = canonical_json(
            &serde_json::to_value(pipeline).expect("pipeline spec serializes to JSON"),
        );
        let mut hasher = Sha256::new();
        hasher.update(input_identity.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        hasher.update([0u8]);
        hasher.update(engine_version.as_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 32 bytes"))?;
        Ok(Fingerprint(arr))
    }
}

/// Canonical JSON rendering: keys sorted lexicographically at every depth,
/// no whitespace, numbers in shortest decimal form, strings in NFC.
///
/// `serde_json`'s default map is ordered by key and its number formatting
/// is already shortest-form; NFC normalization is applied here.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&normalize(value)).expect("canonical JSON serializes")
}

fn normalize(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(s.nfc().collect()),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.nfc().collect::<String>(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
