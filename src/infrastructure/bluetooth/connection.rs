//! BLE Connection Module
//!
//! Owns the peripheral lifecycle from connect through GATT resolution to
//! Ready, and back to Idle on loss. Handles live inside the state variants,
//! so a channel can only be reached while Ready.
//!
//! A link dropped on purpose passes through `Disconnecting` and is only
//! forgotten once the platform reports it gone, so a late disconnect can
//! never be mistaken for the loss of a newer link to the same board.

use crate::domain::error::DiscoveryFailure;
use crate::domain::models::ConnectionPhase;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, ChannelHandle, CharacteristicHandle, PeripheralHandle, ServiceHandle,
};
use crate::infrastructure::bluetooth::protocol::TargetDescriptor;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting {
        peripheral: PeripheralHandle,
    },
    ServicesDiscovering {
        peripheral: PeripheralHandle,
    },
    CharacteristicsDiscovering {
        service: ServiceHandle,
    },
    Ready {
        channel: ChannelHandle,
    },
    Disconnecting {
        peripheral: PeripheralHandle,
    },
}

impl ConnectionState {
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            Self::Idle => ConnectionPhase::Idle,
            Self::Scanning => ConnectionPhase::Scanning,
            Self::Connecting { .. } => ConnectionPhase::Connecting,
            Self::ServicesDiscovering { .. } => ConnectionPhase::ServicesDiscovering,
            Self::CharacteristicsDiscovering { .. } => ConnectionPhase::CharacteristicsDiscovering,
            Self::Ready { .. } => ConnectionPhase::Ready,
            Self::Disconnecting { .. } => ConnectionPhase::Disconnecting,
        }
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        match self {
            Self::Idle | Self::Scanning => None,
            Self::Connecting { peripheral }
            | Self::ServicesDiscovering { peripheral }
            | Self::Disconnecting { peripheral } => Some(peripheral),
            Self::CharacteristicsDiscovering { service } => Some(&service.peripheral),
            Self::Ready { channel } => Some(channel.peripheral()),
        }
    }
}

/// Result of feeding a callback into the state machine.
pub type StepResult = Result<Option<ConnectionPhase>, DiscoveryFailure>;

#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.state.peripheral()
    }

    /// The bound write channel, present only while Ready.
    pub fn channel(&self) -> Option<&ChannelHandle> {
        match &self.state {
            ConnectionState::Ready { channel } => Some(channel),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ConnectionState::Scanning
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Ready { .. })
    }

    /// `Idle -> Scanning`. Returns false from any other state.
    pub fn begin_scanning(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.state = ConnectionState::Scanning;
        true
    }

    /// `Scanning -> Idle`.
    pub fn end_scanning(&mut self) -> bool {
        if !self.is_scanning() {
            return false;
        }
        self.state = ConnectionState::Idle;
        true
    }

    /// `Scanning -> Connecting`, taking ownership of the matched peripheral.
    pub fn begin_connecting(&mut self, peripheral: PeripheralHandle) -> bool {
        if !self.is_scanning() {
            return false;
        }
        self.state = ConnectionState::Connecting { peripheral };
        true
    }

    /// `Connecting -> ServicesDiscovering` on connect success.
    ///
    /// A link to a peripheral that is not held is dropped again, since
    /// nothing else would ever release it.
    pub fn on_connected(
        &mut self,
        platform: &mut dyn BlePlatform,
        target: &TargetDescriptor,
        peripheral: &PeripheralHandle,
    ) -> StepResult {
        if self.peripheral() != Some(peripheral) {
            info!("Dropping stray link to {} in {:?}", peripheral, self.phase());
            platform.disconnect(peripheral);
            return Ok(None);
        }
        let ConnectionState::Connecting { peripheral: held } = &self.state else {
            debug!("Ignoring connect for {} in {:?}", peripheral, self.phase());
            return Ok(None);
        };

        let peripheral = held.clone();
        info!("Connected to {}, discovering services", peripheral);
        platform.discover_services(&peripheral, &[target.service_uuid]);
        self.state = ConnectionState::ServicesDiscovering { peripheral };
        Ok(Some(ConnectionPhase::ServicesDiscovering))
    }

    /// `ServicesDiscovering -> CharacteristicsDiscovering` once the target
    /// service is resolved.
    pub fn on_services_discovered(
        &mut self,
        platform: &mut dyn BlePlatform,
        target: &TargetDescriptor,
        peripheral: &PeripheralHandle,
        services: &[Uuid],
        error: Option<&str>,
    ) -> StepResult {
        let ConnectionState::ServicesDiscovering { peripheral: held } = &self.state else {
            debug!("Ignoring services for {} in {:?}", peripheral, self.phase());
            return Ok(None);
        };
        if held != peripheral {
            debug!("Ignoring services for unrelated peripheral {}", peripheral);
            return Ok(None);
        }

        if let Some(error) = error {
            return Err(DiscoveryFailure::Platform(error.to_string()));
        }
        if !services.contains(&target.service_uuid) {
            return Err(DiscoveryFailure::ServiceMissing(target.service_uuid));
        }

        let service = ServiceHandle {
            peripheral: held.clone(),
            uuid: target.service_uuid,
        };
        info!("Found service {}, discovering characteristics", service.uuid);
        platform.discover_characteristics(&service, &target.characteristic_uuids());
        self.state = ConnectionState::CharacteristicsDiscovering { service };
        Ok(Some(ConnectionPhase::CharacteristicsDiscovering))
    }

    /// `CharacteristicsDiscovering -> Ready`: binds the write channel and
    /// enables notifications on the notify characteristic.
    pub fn on_characteristics_discovered(
        &mut self,
        platform: &mut dyn BlePlatform,
        target: &TargetDescriptor,
        service: &ServiceHandle,
        characteristics: &[Uuid],
        error: Option<&str>,
    ) -> StepResult {
        let ConnectionState::CharacteristicsDiscovering { service: held } = &self.state else {
            debug!("Ignoring characteristics in {:?}", self.phase());
            return Ok(None);
        };
        if held != service {
            debug!("Ignoring characteristics for unrelated service {:?}", service);
            return Ok(None);
        }

        if let Some(error) = error {
            return Err(DiscoveryFailure::Platform(error.to_string()));
        }
        for uuid in target.characteristic_uuids() {
            if !characteristics.contains(&uuid) {
                return Err(DiscoveryFailure::CharacteristicMissing(uuid));
            }
        }

        let channel = CharacteristicHandle {
            service: held.clone(),
            uuid: target.write_char_uuid,
        };
        let notify = CharacteristicHandle {
            service: held.clone(),
            uuid: target.notify_char_uuid,
        };
        platform.set_notify(&notify, true);

        info!("Write channel bound on {}", channel.peripheral());
        self.state = ConnectionState::Ready { channel };
        Ok(Some(ConnectionPhase::Ready))
    }

    /// Ask the platform to drop the held peripheral and wait in
    /// `Disconnecting` for the confirmation. Returns the released handle.
    pub fn begin_disconnecting(
        &mut self,
        platform: &mut dyn BlePlatform,
    ) -> Option<PeripheralHandle> {
        if matches!(self.state, ConnectionState::Disconnecting { .. }) {
            return None;
        }
        let peripheral = self.peripheral()?.clone();
        platform.disconnect(&peripheral);
        self.state = ConnectionState::Disconnecting {
            peripheral: peripheral.clone(),
        };
        Some(peripheral)
    }

    /// `* -> Idle` on a disconnect for the held peripheral, including the
    /// confirmation that ends `Disconnecting`.
    ///
    /// Returns true when the disconnect applied.
    pub fn on_disconnected(&mut self, peripheral: &PeripheralHandle) -> bool {
        if self.peripheral() != Some(peripheral) {
            debug!(
                "Ignoring disconnect for {} in {:?}",
                peripheral,
                self.phase()
            );
            return false;
        }
        self.state = ConnectionState::Idle;
        true
    }

    /// Force Idle from any state, handing back the peripheral if one was held.
    pub fn reset(&mut self) -> Option<PeripheralHandle> {
        let previous = std::mem::take(&mut self.state);
        previous.peripheral().cloned()
    }
}
