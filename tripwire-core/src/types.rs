// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Identifiers validate their invariants at creation time so the engine never
//! has to re-check them on the evaluation path.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum accepted length of an application identifier.
const MAX_APP_ID_LEN: usize = 128;

/// Validated application identifier.
/// Must be non-empty, printable, without whitespace, max 128 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    /// Create a new AppId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "app_id",
                value: id,
                reason: "Application ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_APP_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "app_id",
                value: id.clone(),
                reason: format!(
                    "Application ID too long: {} chars (max {})",
                    id.len(),
                    MAX_APP_ID_LEN
                ),
            });
        }

        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "app_id",
                value: id,
                reason: "Application ID must not contain whitespace or control characters"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AppId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> Self {
        id.0
    }
}

/// Index of a running application instance as reported by the platform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InstanceIndex(u32);

impl InstanceIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMillis)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_app_id() {
        assert!(AppId::new("3f1c2a9e-5b7d-4e0a-9c1b-2d8e6f4a0b1c").is_ok());
        assert!(AppId::new("my_app").is_ok());
    }

    #[test]
    fn test_invalid_app_id() {
        assert!(AppId::new("").is_err());
        assert!(AppId::new("has space").is_err());
        assert!(AppId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_app_id_serde_validates() {
        let ok: Result<AppId, _> = serde_json::from_str("\"app-1\"");
        assert!(ok.is_ok());
        let bad: Result<AppId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_instance_index_transparent() {
        let idx: InstanceIndex = serde_json::from_str("3").unwrap();
        assert_eq!(idx.value(), 3);
        assert_eq!(idx.to_string(), "3");
    }
}
