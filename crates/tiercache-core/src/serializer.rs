//! Wire encoding of [`CacheEntry`] envelopes.
//!
//! Drivers only ever see strings; the serializer decides what those strings
//! look like. Timestamps are written as absolute epoch milliseconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};

/// Converts entries to and from the representation stored by drivers.
pub trait CacheSerializer: Send + Sync {
    fn serialize(&self, entry: &CacheEntry) -> Result<String>;

    /// Fails with [`CacheError::Decode`] on any malformed envelope.
    fn deserialize(&self, raw: &str) -> Result<CacheEntry>;
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    value: Value,
    #[serde(rename = "logicalExpiration")]
    logical_expiration: u64,
    #[serde(
        rename = "earlyExpiration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    early_expiration: Option<u64>,
    #[serde(
        rename = "graceExpiration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    grace_expiration: Option<u64>,
}

/// JSON envelope serializer.
///
/// ```text
/// {"value":{...},"logicalExpiration":1700000000000,"earlyExpiration":...,"graceExpiration":...}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl CacheSerializer for JsonSerializer {
    fn serialize(&self, entry: &CacheEntry) -> Result<String> {
        let envelope = WireEnvelope {
            value: entry.value().clone(),
            logical_expiration: entry.logical_expire_at(),
            early_expiration: entry.early_expire_at(),
            grace_expiration: entry.grace_expire_at(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn deserialize(&self, raw: &str) -> Result<CacheEntry> {
        let envelope: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| CacheError::decode(format!("malformed cache envelope: {e}")))?;

        CacheEntry::new(
            envelope.value,
            envelope.logical_expiration,
            envelope.early_expiration,
            envelope.grace_expiration,
        )
    }
}
