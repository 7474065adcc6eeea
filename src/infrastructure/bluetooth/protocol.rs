//! VibMotor Protocol
//!
//! Identifiers and wire commands for the vibration motor board. The board
//! exposes the Nordic UART Service: the central writes ASCII commands to the
//! RX characteristic and may subscribe to the TX characteristic.

use std::fmt;
use uuid::Uuid;

/// Nordic UART Service UUID
pub const SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// RX characteristic UUID - where commands are written
pub const WRITE_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// TX characteristic UUID - where the board notifies
pub const NOTIFY_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

pub const SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const WRITE_CHAR: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NOTIFY_CHAR: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Advertised names containing this substring are accepted (case-sensitive)
pub const DEVICE_NAME_FILTER: &str = "VibMotor";

/// Delay between the ON and OFF writes of a pulse
pub const PULSE_OFF_DELAY_MS: u64 = 500;

/// The peripheral this session is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    pub name_filter: String,
}

impl TargetDescriptor {
    /// First-match name test. Unnamed peripherals never match.
    pub fn matches_name(&self, name: Option<&str>) -> bool {
        name.is_some_and(|name| name.contains(self.name_filter.as_str()))
    }

    /// Characteristics requested during discovery, write target first.
    pub fn characteristic_uuids(&self) -> [Uuid; 2] {
        [self.write_char_uuid, self.notify_char_uuid]
    }
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE,
            write_char_uuid: WRITE_CHAR,
            notify_char_uuid: NOTIFY_CHAR,
            name_filter: DEVICE_NAME_FILTER.to_string(),
        }
    }
}

/// Motor commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Drive the motor
    Activate,
    /// Stop the motor
    Deactivate,
}

impl Command {
    /// Raw payload. The board reads plain ASCII with no framing.
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "ON",
            Self::Deactivate => "OFF",
        }
    }

    /// Recognise a command echoed back by the board.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"ON" => Some(Self::Activate),
            b"OFF" => Some(Self::Deactivate),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_agree() {
        assert_eq!(Uuid::parse_str(SERVICE_UUID).unwrap(), SERVICE);
        assert_eq!(Uuid::parse_str(WRITE_CHAR_UUID).unwrap(), WRITE_CHAR);
        assert_eq!(Uuid::parse_str(NOTIFY_CHAR_UUID).unwrap(), NOTIFY_CHAR);
        assert_eq!(
            SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::Activate.as_bytes(), &[0x4F, 0x4E]);
        assert_eq!(Command::Deactivate.as_bytes(), &[0x4F, 0x46, 0x46]);
        assert_eq!(Command::parse(b"OFF"), Some(Command::Deactivate));
        assert_eq!(Command::parse(b"on"), None);
        assert_eq!(Command::parse(b"ON\n"), None);
        assert_eq!(Command::Activate.to_string(), "ON");
    }

    #[test]
    fn test_name_filter() {
        let target = TargetDescriptor::default();
        assert!(target.matches_name(Some("VibMotor-42")));
        assert!(target.matches_name(Some("Lab VibMotor")));
        assert!(!target.matches_name(Some("vibmotor-42")));
        assert!(!target.matches_name(Some("Thermostat")));
        assert!(!target.matches_name(None));
    }
}
