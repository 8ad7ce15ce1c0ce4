//! Opaque JSON payload.
//!
//! Task inputs and outputs are never inspected by the dispatcher, but
//! they must survive a store round trip byte-identical. `serde_json::
//! Value` re-serialization loses key order and whitespace, so payloads
//! are carried as raw JSON text validated once at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// An opaque, validated JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Validate and wrap a JSON string. The exact bytes are preserved.
    pub fn from_string(json: impl Into<String>) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.into()).map(Self)
    }

    /// The raw JSON text.
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    /// Borrow as a raw value for embedding in responses.
    pub fn as_raw(&self) -> &RawValue {
        &self.0
    }
}

impl From<Box<RawValue>> for Payload {
    fn from(raw: Box<RawValue>) -> Self {
        Self(raw)
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.get())
    }
}
