//! BLE Scanner Module
//!
//! Discovery scoped to the target service. The first peripheral whose
//! advertised name contains the filter wins; there is no RSSI tie-break and
//! no scan timeout.

use crate::infrastructure::bluetooth::adapter::AdapterStateTracker;
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::platform::{BlePlatform, PeripheralHandle};
use crate::infrastructure::bluetooth::protocol::TargetDescriptor;
use tracing::{debug, info};

pub struct ScanController {
    target: TargetDescriptor,
}

impl ScanController {
    pub fn new(target: TargetDescriptor) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Start a duplicate-filtered scan for the target service.
    ///
    /// Silently does nothing unless the radio is powered on and the session
    /// is idle. Returns whether a scan was started.
    pub fn start(
        &self,
        platform: &mut dyn BlePlatform,
        adapter: &AdapterStateTracker,
        machine: &mut ConnectionStateMachine,
    ) -> bool {
        if !adapter.is_powered_on() {
            debug!("Not scanning, adapter is {}", adapter.state());
            return false;
        }
        if !machine.begin_scanning() {
            debug!("Not scanning, session is {:?}", machine.phase());
            return false;
        }

        info!(
            "Starting BLE scan for service {} (name contains {:?})",
            self.target.service_uuid, self.target.name_filter
        );
        platform.scan(self.target.service_uuid, false);
        true
    }

    /// Stop an active scan and return to idle.
    pub fn stop(&self, platform: &mut dyn BlePlatform, machine: &mut ConnectionStateMachine) -> bool {
        if !machine.end_scanning() {
            return false;
        }
        info!("Stopping BLE scan...");
        platform.stop_scan();
        true
    }

    /// Handle a discovery report. On the first name match the scan is
    /// stopped and a connect is issued.
    pub fn on_discovered(
        &self,
        platform: &mut dyn BlePlatform,
        machine: &mut ConnectionStateMachine,
        peripheral: &PeripheralHandle,
        name: Option<&str>,
    ) -> bool {
        if !machine.is_scanning() {
            return false;
        }
        if !self.target.matches_name(name) {
            debug!("Skipping {} ({:?})", peripheral, name);
            return false;
        }

        info!("Found {:?} at {}", name.unwrap_or_default(), peripheral);
        platform.stop_scan();
        machine.begin_connecting(peripheral.clone());
        platform.connect(peripheral);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AdapterState, ConnectionPhase};
    use crate::infrastructure::bluetooth::platform::mock::{PlatformCall, RecordingPlatform};
    use crate::infrastructure::bluetooth::protocol::SERVICE;

    fn powered_on() -> AdapterStateTracker {
        let mut adapter = AdapterStateTracker::new();
        adapter.update(AdapterState::PoweredOn);
        adapter
    }

    #[test]
    fn test_start_requires_powered_on() {
        let mut platform = RecordingPlatform::default();
        let mut machine = ConnectionStateMachine::new();
        let scanner = ScanController::new(TargetDescriptor::default());

        assert!(!scanner.start(&mut platform, &AdapterStateTracker::new(), &mut machine));
        assert!(platform.calls.is_empty());
        assert!(machine.is_idle());

        assert!(scanner.start(&mut platform, &powered_on(), &mut machine));
        assert_eq!(
            platform.calls,
            vec![PlatformCall::Scan {
                service: SERVICE,
                allow_duplicates: false
            }]
        );
        assert!(machine.is_scanning());
    }

    #[test]
    fn test_start_while_busy_is_noop() {
        let mut platform = RecordingPlatform::default();
        let mut machine = ConnectionStateMachine::new();
        let scanner = ScanController::new(TargetDescriptor::default());
        let adapter = powered_on();

        assert!(scanner.start(&mut platform, &adapter, &mut machine));
        assert!(!scanner.start(&mut platform, &adapter, &mut machine));
        assert_eq!(platform.scan_requests(), 1);
    }

    #[test]
    fn test_first_match_wins() {
        let mut platform = RecordingPlatform::default();
        let mut machine = ConnectionStateMachine::new();
        let scanner = ScanController::new(TargetDescriptor::default());
        scanner.start(&mut platform, &powered_on(), &mut machine);

        let speaker = PeripheralHandle::new("speaker");
        let first = PeripheralHandle::new("motor-1");
        let second = PeripheralHandle::new("motor-2");

        assert!(!scanner.on_discovered(&mut platform, &mut machine, &speaker, Some("Speaker")));
        assert!(!scanner.on_discovered(&mut platform, &mut machine, &speaker, None));
        assert!(scanner.on_discovered(&mut platform, &mut machine, &first, Some("VibMotor-42")));
        assert!(!scanner.on_discovered(&mut platform, &mut machine, &second, Some("VibMotor-43")));

        assert_eq!(machine.phase(), ConnectionPhase::Connecting);
        assert_eq!(machine.peripheral(), Some(&first));
        assert_eq!(
            &platform.calls[1..],
            &[PlatformCall::StopScan, PlatformCall::Connect(first)]
        );
    }

    #[test]
    fn test_stop_only_when_scanning() {
        let mut platform = RecordingPlatform::default();
        let mut machine = ConnectionStateMachine::new();
        let scanner = ScanController::new(TargetDescriptor::default());

        assert!(!scanner.stop(&mut platform, &mut machine));
        scanner.start(&mut platform, &powered_on(), &mut machine);
        assert!(scanner.stop(&mut platform, &mut machine));
        assert!(machine.is_idle());
        assert_eq!(platform.last(), Some(&PlatformCall::StopScan));
    }
}
