//! Custom error types for tripwire.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`.
//! Collaborator failures carry their own enums so the controller can decide
//! per call site whether a failure is surfaced or only logged.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AppId;

/// Top-level error type for the trigger evaluation engine.
#[derive(Debug, Error)]
pub enum TripwireError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Trigger not found for application {app_id}")]
    TriggerNotFound { app_id: AppId },

    #[error("Monitor controller has been shut down")]
    ShutDown,

    // =========================================================================
    // Collaborator Errors - best effort, usually logged rather than surfaced
    // =========================================================================
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors reject configuration or trigger definitions
/// before they reach the engine.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Failures reported by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Record not found: {entity} {key}")]
    NotFound { entity: &'static str, key: String },
}

/// Failures reported by the cloud platform metadata API.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Application {app_id} not found on platform")]
    AppNotFound { app_id: AppId },
}

/// Failures reported while turning a trigger event into a scaling action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Scaling action failed for {app_id}: {reason}")]
    Failed { app_id: AppId, reason: String },
}

/// Result type alias using TripwireError.
pub type TripwireResult<T> = Result<T, TripwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "metric",
            context: "trigger 'upper'".to_string(),
        };
        assert!(err.to_string().contains("metric"));
        assert!(err.to_string().contains("upper"));
    }

    #[test]
    fn test_error_chain() {
        let store_err = StoreError::Unavailable {
            reason: "connection refused".to_string(),
        };
        let err: TripwireError = store_err.into();
        assert!(matches!(err, TripwireError::Store(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_trigger_not_found_names_app() {
        let err = TripwireError::TriggerNotFound {
            app_id: AppId::new("app-42").unwrap(),
        };
        assert_eq!(err.to_string(), "Trigger not found for application app-42");
    }
}
