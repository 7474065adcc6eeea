//! Adapter State Tracker
//!
//! Tracks the local radio's availability independently of any peripheral.

use crate::domain::models::AdapterState;
use tracing::info;

/// What a radio state change means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterTransition {
    /// The radio became usable; scanning may start.
    Available,
    /// The radio became unusable; everything held must be dropped.
    Lost(AdapterState),
}

#[derive(Debug, Default)]
pub struct AdapterStateTracker {
    state: AdapterState,
}

impl AdapterStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn is_powered_on(&self) -> bool {
        self.state.is_powered_on()
    }

    /// Record a state reported by the platform.
    ///
    /// Returns `None` when the state did not change.
    pub fn update(&mut self, new_state: AdapterState) -> Option<AdapterTransition> {
        if new_state == self.state {
            return None;
        }

        info!("Adapter state: {} -> {}", self.state, new_state);
        self.state = new_state;

        Some(if new_state.is_powered_on() {
            AdapterTransition::Available
        } else {
            AdapterTransition::Lost(new_state)
        })
    }
}
