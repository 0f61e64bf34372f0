//! External identifiers.
//!
//! Every entity exposed outside the service carries an opaque 128-bit id
//! rendered as a prefixed string, e.g. `pbt_0b3f9c6d2a414f0e8d1c7a5b9e2f4d61`.
//! The prefix identifies the entity kind so ids are self-describing in logs
//! and support tickets.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for progress bar ids.
pub const BAR_PREFIX: &str = "pb";
/// Prefix for step spec ids.
pub const STEP_PREFIX: &str = "pbs";
/// Prefix for trace ids.
pub const TRACE_PREFIX: &str = "pbt";
/// Prefix for trace step ids.
pub const TRACE_STEP_PREFIX: &str = "pbts";

/// An opaque external identifier.
///
/// Generated ids embed a random 128-bit payload; ids received from clients
/// (e.g. client-chosen trace uids) are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Generate a fresh id with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, Uuid::new_v4().simple()))
    }

    /// Generate a progress bar id.
    pub fn bar() -> Self {
        Self::generate(BAR_PREFIX)
    }

    /// Generate a step spec id.
    pub fn step() -> Self {
        Self::generate(STEP_PREFIX)
    }

    /// Generate a trace id.
    pub fn trace() -> Self {
        Self::generate(TRACE_PREFIX)
    }

    /// Generate a trace step id.
    pub fn trace_step() -> Self {
        Self::generate(TRACE_STEP_PREFIX)
    }

    /// View as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is safe to embed in store keys: non-empty and free of
    /// the `:` key separator and whitespace.
    pub fn is_key_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl From<String> for ExternalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ExternalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
