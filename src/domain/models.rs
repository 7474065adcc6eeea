use serde::{Deserialize, Serialize};
use std::fmt;

/// Power/availability state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unsupported,
    Unauthorized,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }

    /// Status line shown when the radio reaches this state.
    pub fn status_message(self) -> &'static str {
        match self {
            AdapterState::PoweredOn => "Bluetooth Ready",
            AdapterState::PoweredOff => "Bluetooth Off",
            AdapterState::Unsupported => "Bluetooth Not Supported",
            AdapterState::Unauthorized => "Bluetooth Unauthorized",
            AdapterState::Unknown => "Bluetooth Unavailable",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::PoweredOn => "powered on",
            AdapterState::PoweredOff => "powered off",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
        };
        f.write_str(name)
    }
}

/// Payload-free view of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionPhase {
    Idle,
    Scanning,
    Connecting,
    ServicesDiscovering,
    CharacteristicsDiscovering,
    Ready,
    /// Link released, waiting for the platform to confirm.
    Disconnecting,
}

/// The snapshot the UI layer observes.
///
/// Published as a whole on every transition, never field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub message: String,
    pub scanning: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            message: "Not Connected".to_string(),
            scanning: false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (connected: {}, scanning: {})",
            self.message, self.connected, self.scanning
        )
    }
}
