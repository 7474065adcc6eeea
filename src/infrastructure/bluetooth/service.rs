//! Bluetooth Service Module
//!
//! The session manager: the single event-ordering authority that routes
//! adapter and peripheral events, UI requests and pulse timers through the
//! scanner, the connection state machine and the dispatcher, republishing
//! the status after every transition.
//!
//! Reconnection policy: any loss of the held peripheral immediately restarts
//! scanning. Retries are unconditional and unbounded, with no backoff. A
//! link dropped after a discovery failure is rescanned only once the
//! platform confirms it is gone.

use crate::domain::error::{DiscoveryFailure, SessionError};
use crate::domain::models::{AdapterState, ConnectionPhase, SessionStatus};
use crate::infrastructure::bluetooth::adapter::{AdapterStateTracker, AdapterTransition};
use crate::infrastructure::bluetooth::connection::{ConnectionStateMachine, StepResult};
use crate::infrastructure::bluetooth::dispatcher::CommandDispatcher;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, PeripheralHandle, PlatformEvent, ServiceHandle,
};
use crate::infrastructure::bluetooth::protocol::{Command, TargetDescriptor};
use crate::infrastructure::bluetooth::scanner::ScanController;
use crate::infrastructure::bluetooth::status::StatusPublisher;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the session reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartScanning,
    TriggerPulse,
    Platform(PlatformEvent),
    PulseElapsed(u64),
    Shutdown,
}

/// Cloneable front door used by the UI layer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    mailbox: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(mailbox: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { mailbox }
    }

    pub fn start_scanning(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StartScanning)
    }

    pub fn trigger_pulse(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::TriggerPulse)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.mailbox
            .send(command)
            .map_err(|_| SessionError::MailboxClosed)
    }
}

pub struct SessionManager<P: BlePlatform> {
    platform: P,
    adapter: AdapterStateTracker,
    scanner: ScanController,
    machine: ConnectionStateMachine,
    dispatcher: CommandDispatcher,
    status: StatusPublisher,
}

impl<P: BlePlatform> SessionManager<P> {
    /// `mailbox` must feed the receiver later passed to [`SessionManager::run`];
    /// pulse timers post their expiry through it.
    pub fn new(
        platform: P,
        target: TargetDescriptor,
        pulse_delay: Duration,
        mailbox: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            platform,
            adapter: AdapterStateTracker::new(),
            scanner: ScanController::new(target),
            machine: ConnectionStateMachine::new(),
            dispatcher: CommandDispatcher::new(pulse_delay, mailbox),
            status: StatusPublisher::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.machine.phase()
    }

    pub fn target(&self) -> &TargetDescriptor {
        self.scanner.target()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Drain the mailbox until a shutdown is requested.
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Session started, looking for {:?}", self.target().name_filter);
        while let Some(command) = mailbox.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }
        self.shutdown();
        info!("Session stopped");
    }

    /// Apply one command. Returns false once the session should stop.
    pub fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::StartScanning => {
                self.start_scanning();
            }
            SessionCommand::TriggerPulse => {
                self.trigger_pulse();
            }
            SessionCommand::Platform(event) => self.handle_event(event),
            SessionCommand::PulseElapsed(pulse_id) => {
                self.dispatcher
                    .on_pulse_elapsed(&mut self.platform, &self.machine, pulse_id);
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }

    pub fn handle_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            PlatformEvent::PeripheralDiscovered { peripheral, name } => {
                self.on_discovered(&peripheral, name.as_deref())
            }
            PlatformEvent::Connected(peripheral) => self.on_connected(&peripheral),
            PlatformEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(&peripheral, error.as_deref())
            }
            PlatformEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => self.on_services_discovered(&peripheral, &services, error.as_deref()),
            PlatformEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => self.on_characteristics_discovered(&service, &characteristics, error.as_deref()),
            PlatformEvent::NotificationReceived {
                peripheral,
                characteristic,
                value,
            } => self.on_notification(&peripheral, characteristic, &value),
        }
    }

    /// Begin scanning if the radio is on and nothing is in progress.
    pub fn start_scanning(&mut self) -> bool {
        if let Err(e) = self.check_adapter() {
            debug!("Scan request ignored: {}", e);
            return false;
        }
        if !self
            .scanner
            .start(&mut self.platform, &self.adapter, &mut self.machine)
        {
            return false;
        }
        self.status.publish(&self.machine, Some("Scanning..."));
        true
    }

    /// Send one `ON`/`OFF` pulse. Silently ignored unless Ready.
    pub fn trigger_pulse(&mut self) -> bool {
        self.dispatcher
            .trigger_pulse(&mut self.platform, &self.machine)
    }

    /// Stop scanning, drop any held peripheral and cancel pending pulses.
    pub fn shutdown(&mut self) {
        self.release_link();
        self.status.publish(&self.machine, Some("Disconnected"));
    }

    fn check_adapter(&self) -> Result<(), SessionError> {
        match self.adapter.state() {
            AdapterState::PoweredOn => Ok(()),
            state => Err(SessionError::AdapterUnavailable(state)),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        match self.adapter.update(state) {
            None => {}
            Some(AdapterTransition::Available) => {
                info!("Bluetooth adapter available");
                self.resume_scanning(state.status_message());
            }
            Some(AdapterTransition::Lost(state)) => {
                warn!("Bluetooth adapter lost: {}", state);
                self.release_link();
                self.status
                    .publish(&self.machine, Some(state.status_message()));
            }
        }
    }

    fn on_discovered(&mut self, peripheral: &PeripheralHandle, name: Option<&str>) {
        if self
            .scanner
            .on_discovered(&mut self.platform, &mut self.machine, peripheral, name)
        {
            self.status.publish(&self.machine, Some("Connecting..."));
        }
    }

    fn on_connected(&mut self, peripheral: &PeripheralHandle) {
        let step = self
            .machine
            .on_connected(&mut self.platform, self.scanner.target(), peripheral);
        self.apply_step(step);
    }

    fn on_services_discovered(
        &mut self,
        peripheral: &PeripheralHandle,
        services: &[Uuid],
        error: Option<&str>,
    ) {
        let step = self.machine.on_services_discovered(
            &mut self.platform,
            self.scanner.target(),
            peripheral,
            services,
            error,
        );
        self.apply_step(step);
    }

    fn on_characteristics_discovered(
        &mut self,
        service: &ServiceHandle,
        characteristics: &[Uuid],
        error: Option<&str>,
    ) {
        let step = self.machine.on_characteristics_discovered(
            &mut self.platform,
            self.scanner.target(),
            service,
            characteristics,
            error,
        );
        self.apply_step(step);
    }

    fn apply_step(&mut self, step: StepResult) {
        match step {
            Ok(None) => {}
            Ok(Some(ConnectionPhase::ServicesDiscovering)) => {
                self.status.publish(&self.machine, Some("Connected"));
            }
            Ok(Some(ConnectionPhase::Ready)) => {
                info!("Session ready");
                self.status.publish(&self.machine, Some("Connected"));
            }
            Ok(Some(_)) => {
                self.status.publish(&self.machine, None);
            }
            Err(failure) => self.fail_discovery(failure),
        }
    }

    /// Missing service/characteristic or a platform error during discovery:
    /// drop the link. Scanning resumes when the platform confirms.
    fn fail_discovery(&mut self, failure: DiscoveryFailure) {
        let err = SessionError::from(failure);
        error!("{}", err);
        self.dispatcher.cancel_all();
        self.machine.begin_disconnecting(&mut self.platform);
        self.status.publish(&self.machine, Some(&err.to_string()));
    }

    fn on_disconnected(&mut self, peripheral: &PeripheralHandle, error: Option<&str>) {
        let released = self.machine.phase() == ConnectionPhase::Disconnecting;
        if !self.machine.on_disconnected(peripheral) {
            return;
        }
        match error {
            _ if released => info!("Released {}", peripheral),
            Some(error) => warn!("Disconnected from {}: {}", peripheral, error),
            None => info!("Disconnected from {}", peripheral),
        }
        self.dispatcher.cancel_all();
        self.resume_scanning("Disconnected");
    }

    fn on_notification(&mut self, peripheral: &PeripheralHandle, characteristic: Uuid, value: &[u8]) {
        if self.machine.peripheral() != Some(peripheral) {
            return;
        }
        match Command::parse(value) {
            Some(command) => debug!("Board reports {}", command),
            None => debug!(
                "Notification on {}: {:?}",
                characteristic,
                String::from_utf8_lossy(value)
            ),
        }
    }

    /// Scan again, or show `fallback` when scanning cannot start. Either
    /// way subscribers see a single snapshot.
    fn resume_scanning(&mut self, fallback: &str) {
        if !self.start_scanning() {
            self.status.publish(&self.machine, Some(fallback));
        }
    }

    /// Force Idle: stop any scan, ask the platform to drop a held
    /// peripheral and cancel pending pulses.
    fn release_link(&mut self) {
        if !self.scanner.stop(&mut self.platform, &mut self.machine) {
            if let Some(peripheral) = self.machine.reset() {
                self.platform.disconnect(&peripheral);
            }
        }
        self.dispatcher.cancel_all();
    }
}
