//! Platform Boundary
//!
//! Everything the session consumes from the BLE stack ([`BlePlatform`]) and
//! everything the stack reports back ([`PlatformEvent`]). Calls are
//! fire-and-forget: results come back later as events on the session mailbox.

use crate::domain::models::AdapterState;
use std::fmt;
use uuid::Uuid;

/// Opaque reference to a discovered remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved service on a specific peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub peripheral: PeripheralHandle,
    pub uuid: Uuid,
}

/// A resolved characteristic within a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: ServiceHandle,
    pub uuid: Uuid,
}

impl CharacteristicHandle {
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.service.peripheral
    }
}

/// The bound write characteristic. Only exists while the session is Ready.
pub type ChannelHandle = CharacteristicHandle;

/// Operations the session issues against the BLE stack.
///
/// None of these may block. Implementations report outcomes through
/// [`PlatformEvent`]s, applying operations in the order they were issued.
///
/// `Disconnected` is reported at most once per established link, whether
/// the link dropped on its own or was released with `disconnect`. Links
/// that vanish with the radio are not reported after the adapter leaves
/// PoweredOn. A failed `connect` is reported as `Disconnected` carrying
/// the error.
pub trait BlePlatform: Send {
    fn scan(&mut self, service: Uuid, allow_duplicates: bool);
    fn stop_scan(&mut self);
    fn connect(&mut self, peripheral: &PeripheralHandle);
    fn disconnect(&mut self, peripheral: &PeripheralHandle);
    fn discover_services(&mut self, peripheral: &PeripheralHandle, services: &[Uuid]);
    fn discover_characteristics(&mut self, service: &ServiceHandle, characteristics: &[Uuid]);
    /// Fire-and-forget write, without response.
    fn write(&mut self, channel: &ChannelHandle, bytes: &[u8]);
    fn set_notify(&mut self, characteristic: &CharacteristicHandle, enabled: bool);
}

/// Events produced by the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    PeripheralDiscovered {
        peripheral: PeripheralHandle,
        name: Option<String>,
    },
    Connected(PeripheralHandle),
    Disconnected {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralHandle,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        service: ServiceHandle,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    NotificationReceived {
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PlatformCall {
        Scan {
            service: Uuid,
            allow_duplicates: bool,
        },
        StopScan,
        Connect(PeripheralHandle),
        Disconnect(PeripheralHandle),
        DiscoverServices(PeripheralHandle, Vec<Uuid>),
        DiscoverCharacteristics(ServiceHandle, Vec<Uuid>),
        Write(ChannelHandle, Vec<u8>),
        SetNotify(CharacteristicHandle, bool),
    }

    /// Records every call for later inspection.
    #[derive(Debug, Default)]
    pub struct RecordingPlatform {
        pub calls: Vec<PlatformCall>,
    }

    impl RecordingPlatform {
        pub fn writes(&self) -> Vec<&[u8]> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    PlatformCall::Write(_, bytes) => Some(bytes.as_slice()),
                    _ => None,
                })
                .collect()
        }

        pub fn scan_requests(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| matches!(call, PlatformCall::Scan { .. }))
                .count()
        }

        pub fn disconnects(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| matches!(call, PlatformCall::Disconnect(_)))
                .count()
        }

        pub fn last(&self) -> Option<&PlatformCall> {
            self.calls.last()
        }
    }

    impl BlePlatform for RecordingPlatform {
        fn scan(&mut self, service: Uuid, allow_duplicates: bool) {
            self.calls.push(PlatformCall::Scan {
                service,
                allow_duplicates,
            });
        }

        fn stop_scan(&mut self) {
            self.calls.push(PlatformCall::StopScan);
        }

        fn connect(&mut self, peripheral: &PeripheralHandle) {
            self.calls.push(PlatformCall::Connect(peripheral.clone()));
        }

        fn disconnect(&mut self, peripheral: &PeripheralHandle) {
            self.calls.push(PlatformCall::Disconnect(peripheral.clone()));
        }

        fn discover_services(&mut self, peripheral: &PeripheralHandle, services: &[Uuid]) {
            self.calls.push(PlatformCall::DiscoverServices(
                peripheral.clone(),
                services.to_vec(),
            ));
        }

        fn discover_characteristics(&mut self, service: &ServiceHandle, characteristics: &[Uuid]) {
            self.calls.push(PlatformCall::DiscoverCharacteristics(
                service.clone(),
                characteristics.to_vec(),
            ));
        }

        fn write(&mut self, channel: &ChannelHandle, bytes: &[u8]) {
            self.calls
                .push(PlatformCall::Write(channel.clone(), bytes.to_vec()));
        }

        fn set_notify(&mut self, characteristic: &CharacteristicHandle, enabled: bool) {
            self.calls
                .push(PlatformCall::SetNotify(characteristic.clone(), enabled));
        }
    }
}
