// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-trigger breach state machine.
//!
//! Implements the breach lifecycle: NotBreaching → Pending → Fired.
//! Any state falls back to NotBreaching the moment the aggregated value stops
//! crossing the threshold. Fired is re-entered on every breaching pass, so a
//! persistent breach keeps producing events at the evaluation cadence.

use serde::{Deserialize, Serialize};

use crate::types::TimestampMillis;

/// Breach lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreachState {
    /// Initial state - the threshold is not currently crossed.
    NotBreaching,

    /// The threshold has been crossed since `since`, but not for long enough.
    Pending { since: TimestampMillis },

    /// The breach has lasted at least the breach duration.
    Fired { since: TimestampMillis },
}

impl BreachState {
    /// Get the state name for log messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotBreaching => "NotBreaching",
            Self::Pending { .. } => "Pending",
            Self::Fired { .. } => "Fired",
        }
    }

    /// Start of the current breach run, if any.
    pub fn since(&self) -> Option<TimestampMillis> {
        match self {
            Self::NotBreaching => None,
            Self::Pending { since } | Self::Fired { since } => Some(*since),
        }
    }

    /// Feed one evaluation pass into the state machine.
    ///
    /// Returns the next state and whether an event must be emitted for this
    /// pass. The first breaching pass only starts the timer.
    pub fn advance(
        self,
        breaching: bool,
        now: TimestampMillis,
        breach_duration_ms: u64,
    ) -> (BreachState, bool) {
        if !breaching {
            return (Self::NotBreaching, false);
        }

        match self {
            Self::NotBreaching => (Self::Pending { since: now }, false),
            Self::Pending { since } | Self::Fired { since } => {
                if now.saturating_sub(since) >= breach_duration_ms {
                    (Self::Fired { since }, true)
                } else {
                    (Self::Pending { since }, false)
                }
            }
        }
    }
}

impl Default for BreachState {
    fn default() -> Self {
        Self::NotBreaching
    }
}

impl std::fmt::Display for BreachState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.since() {
            Some(since) => write!(f, "{}(since={})", self.name(), since),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Breach state of one trigger plus bookkeeping for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreachTimer {
    state: BreachState,
    fire_count: u64,
}

impl BreachTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BreachState {
        self.state
    }

    /// Events fired since the timer was created.
    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    /// Apply one pass and report whether to fire.
    pub fn observe(&mut self, breaching: bool, now: TimestampMillis, breach_duration_ms: u64) -> bool {
        let previous = self.state;
        let (next, fire) = previous.advance(breaching, now, breach_duration_ms);

        if previous.name() != next.name() {
            tracing::debug!(
                from = previous.name(),
                to = next.name(),
                since = ?next.since(),
                "Breach state transition"
            );
        }

        self.state = next;
        if fire {
            self.fire_count += 1;
        }
        fire
    }
}
