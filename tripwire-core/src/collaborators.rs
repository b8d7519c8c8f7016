// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Contracts for the services the engine talks to but does not own.
//!
//! The controller holds each collaborator behind an `Arc<dyn Trait>`, so a
//! production deployment can plug in a database, a platform API client and a
//! scaling engine while tests use the in-memory versions from
//! [`crate::memory`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app_cache::BoundApp;
use crate::error::{DispatchError, PlatformError, StoreError};
use crate::metric::AppInstanceMetrics;
use crate::trigger::{Trigger, TriggerEvent};
use crate::types::AppId;

/// Durable storage for triggers, metrics and bindings.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn add_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

    /// Remove every persisted trigger of the application.
    async fn remove_trigger(&self, app_id: &AppId) -> Result<(), StoreError>;

    /// Persist a merged metrics view of the application.
    async fn add_app_stats(&self, snapshot: &AppInstanceMetrics) -> Result<(), StoreError>;

    async fn remove_app_stats_with_history(&self, app_id: &AppId) -> Result<(), StoreError>;

    async fn add_binding(&self, binding: &BoundApp) -> Result<(), StoreError>;

    async fn update_binding(&self, binding: &BoundApp) -> Result<(), StoreError>;

    async fn remove_binding(&self, service_id: &str, app_id: &AppId) -> Result<(), StoreError>;
}

/// Lifecycle state of an application as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AppState {
    Started,
    Stopped,
    Other(String),
}

impl AppState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Other(state) => state,
        }
    }
}

impl From<String> for AppState {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("started") {
            Self::Started
        } else if value.eq_ignore_ascii_case("stopped") {
            Self::Stopped
        } else {
            Self::Other(value)
        }
    }
}

impl From<AppState> for String {
    fn from(state: AppState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live application metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub app_type: String,
    pub mem_quota: f64,
    pub state: AppState,
    pub instance_count: u32,
}

/// Read access to live platform metadata.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn app_info(&self, app_id: &AppId) -> Result<AppInfo, PlatformError>;
}

/// Receiver of fired trigger events.
///
/// Owns the at-most-one-in-flight policy per equivalent event and performs the
/// actual scaling call plus history recording.
#[async_trait]
pub trait ScalingEvents: Send + Sync {
    /// Returns `false` if an equivalent event is already queued or running.
    async fn accept(&self, event: &TriggerEvent) -> bool;

    /// Perform the scaling action for an accepted event.
    async fn process(&self, event: TriggerEvent) -> Result<(), DispatchError>;

    /// Give back the slot of an accepted event that will never reach
    /// `process`, e.g. because the dispatch pool stopped first.
    fn release(&self, event: &TriggerEvent);
}

/// A read-through cache owned by some other component.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &'static str;

    async fn invalidate_all(&self);
}
