// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Scaling sink for the foreground engine.
//!
//! There is no scaling backend behind the CLI: accepted events are written to
//! stdout as JSON lines and counted in the Prometheus registry.

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use tripwire_core::{AppId, DispatchError, ScalingEvents, TriggerEvent, TriggerKey};

use crate::metrics::{SCALE_DISPATCH, TRIGGER_EVENTS};

/// Prints accepted events, one in flight per (application, trigger key).
#[derive(Debug, Default)]
pub struct StdoutScaler {
    in_flight: Mutex<HashSet<(AppId, TriggerKey)>>,
}

impl StdoutScaler {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<(AppId, TriggerKey)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ScalingEvents for StdoutScaler {
    async fn accept(&self, event: &TriggerEvent) -> bool {
        TRIGGER_EVENTS.inc();

        let accepted = self
            .in_flight()
            .insert((event.app_id.clone(), event.trigger.key()));
        if !accepted {
            SCALE_DISPATCH.with_label_values(&["refused"]).inc();
        }
        accepted
    }

    async fn process(&self, event: TriggerEvent) -> Result<(), DispatchError> {
        let key = (event.app_id.clone(), event.trigger.key());

        let result = serde_json::to_string(&event)
            .map_err(|e| e.to_string())
            .and_then(|line| {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", line).map_err(|e| e.to_string())
            });

        self.in_flight().remove(&key);

        match result {
            Ok(()) => {
                SCALE_DISPATCH.with_label_values(&["processed"]).inc();
                Ok(())
            }
            Err(reason) => {
                SCALE_DISPATCH.with_label_values(&["failed"]).inc();
                Err(DispatchError::Failed {
                    app_id: event.app_id,
                    reason,
                })
            }
        }
    }

    fn release(&self, event: &TriggerEvent) {
        self.in_flight()
            .remove(&(event.app_id.clone(), event.trigger.key()));
        SCALE_DISPATCH.with_label_values(&["dropped"]).inc();
    }
}
