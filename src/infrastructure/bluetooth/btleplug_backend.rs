//! btleplug Backend
//!
//! [`BlePlatform`] over `btleplug`. Radio operations are queued to a single
//! worker task and applied strictly in the order the session issued them;
//! results come back through the session mailbox, so the session never
//! awaits the radio.

use crate::domain::models::AdapterState;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, ChannelHandle, CharacteristicHandle, PeripheralHandle, PlatformEvent,
    ServiceHandle,
};
use crate::infrastructure::bluetooth::service::SessionCommand;
use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central as _, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

type Mailbox = mpsc::UnboundedSender<SessionCommand>;

/// What the backend knows about remote devices.
struct Registry<P> {
    known: HashMap<PeripheralHandle, P>,
    /// Duplicate filter for the current scan.
    reported: HashSet<PeripheralHandle>,
    /// Established links. Each is reported gone exactly once.
    connected: HashSet<PeripheralHandle>,
    notify_tasks: HashMap<PeripheralHandle, JoinHandle<()>>,
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            reported: HashSet::new(),
            connected: HashSet::new(),
            notify_tasks: HashMap::new(),
        }
    }
}

impl<P> Registry<P> {
    /// Forget everything from earlier scans except live links.
    fn prune(&mut self) {
        let connected = &self.connected;
        self.known.retain(|handle, _| connected.contains(handle));
        self.reported.clear();
    }

    /// Record a discovery report. Returns false when it is a duplicate that
    /// should not reach the session.
    fn observe(
        &mut self,
        handle: PeripheralHandle,
        peripheral: P,
        named: bool,
        allow_duplicates: bool,
    ) -> bool {
        self.known.insert(handle.clone(), peripheral);
        if allow_duplicates {
            return true;
        }
        if self.reported.contains(&handle) {
            return false;
        }
        // Unnamed reports stay eligible until the name shows up.
        if named {
            self.reported.insert(handle);
        }
        true
    }

    fn link_up(&mut self, handle: &PeripheralHandle) {
        self.connected.insert(handle.clone());
    }

    /// Mark a link as gone. True only the first time for each link.
    fn link_down(&mut self, handle: &PeripheralHandle) -> bool {
        if let Some(task) = self.notify_tasks.remove(handle) {
            task.abort();
        }
        self.connected.remove(handle)
    }

    /// Links die with the radio and are not reported afterwards.
    fn adapter_lost(&mut self) {
        self.connected.clear();
        for (_, task) in self.notify_tasks.drain() {
            task.abort();
        }
    }
}

type SharedRegistry = Arc<Mutex<Registry<Peripheral>>>;

fn with_registry<R>(
    registry: &Mutex<Registry<Peripheral>>,
    f: impl FnOnce(&mut Registry<Peripheral>) -> R,
) -> Option<R> {
    match registry.lock() {
        Ok(mut guard) => Some(f(&mut guard)),
        Err(_) => {
            error!("Peripheral registry lock poisoned");
            None
        }
    }
}

/// One queued radio operation.
enum Operation {
    StartScan(Uuid),
    StopScan,
    Connect(PeripheralHandle, Peripheral),
    Disconnect(PeripheralHandle, Peripheral),
    DiscoverServices(PeripheralHandle, Peripheral, Vec<Uuid>),
    Write(Peripheral, Characteristic, Vec<u8>),
    Subscribe(PeripheralHandle, Peripheral, Characteristic),
    Unsubscribe(Peripheral, Characteristic),
}

/// Drains the operation queue one at a time.
struct Worker {
    adapter: Adapter,
    registry: SharedRegistry,
    mailbox: Mailbox,
}

impl Worker {
    async fn run(self, mut operations: mpsc::UnboundedReceiver<Operation>) {
        while let Some(operation) = operations.recv().await {
            self.apply(operation).await;
        }
        debug!("Bluetooth operation queue closed");
    }

    async fn apply(&self, operation: Operation) {
        match operation {
            Operation::StartScan(service) => {
                let filter = ScanFilter {
                    services: vec![service],
                };
                if let Err(e) = self.adapter.start_scan(filter).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            Operation::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            Operation::Connect(handle, peripheral) => {
                let event = match peripheral.connect().await {
                    Ok(()) => {
                        with_registry(&self.registry, |r| r.link_up(&handle));
                        PlatformEvent::Connected(handle)
                    }
                    Err(e) => PlatformEvent::Disconnected {
                        peripheral: handle,
                        error: Some(e.to_string()),
                    },
                };
                post(&self.mailbox, event);
            }
            Operation::Disconnect(handle, peripheral) => {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect {}: {}", handle, e);
                }
                if with_registry(&self.registry, |r| r.link_down(&handle)).unwrap_or(false) {
                    post(
                        &self.mailbox,
                        PlatformEvent::Disconnected {
                            peripheral: handle,
                            error: None,
                        },
                    );
                }
            }
            Operation::DiscoverServices(handle, peripheral, wanted) => {
                let event = match peripheral.discover_services().await {
                    Ok(()) => {
                        let found: Vec<Uuid> = peripheral
                            .services()
                            .iter()
                            .map(|service| service.uuid)
                            .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                            .collect();
                        debug!("{} exposes {} matching service(s)", handle, found.len());
                        PlatformEvent::ServicesDiscovered {
                            peripheral: handle,
                            services: found,
                            error: None,
                        }
                    }
                    Err(e) => PlatformEvent::ServicesDiscovered {
                        peripheral: handle,
                        services: Vec::new(),
                        error: Some(e.to_string()),
                    },
                };
                post(&self.mailbox, event);
            }
            Operation::Write(peripheral, characteristic, bytes) => {
                match peripheral
                    .write(&characteristic, &bytes, WriteType::WithoutResponse)
                    .await
                {
                    Ok(()) => debug!("Sent command: {}", String::from_utf8_lossy(&bytes)),
                    Err(e) => warn!("Write failed: {}", e),
                }
            }
            Operation::Subscribe(owner, peripheral, characteristic) => {
                match open_notifications(&peripheral, &characteristic).await {
                    Ok(stream) => {
                        let task = tokio::spawn(forward_notifications(
                            stream,
                            characteristic.uuid,
                            owner.clone(),
                            self.mailbox.clone(),
                        ));
                        with_registry(&self.registry, |r| {
                            if let Some(old) = r.notify_tasks.insert(owner, task) {
                                old.abort();
                            }
                        });
                    }
                    Err(e) => warn!("Notifications unavailable: {:#}", e),
                }
            }
            Operation::Unsubscribe(peripheral, characteristic) => {
                if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                    warn!("Failed to disable notifications: {}", e);
                }
            }
        }
    }
}

pub struct BtleplugPlatform {
    registry: SharedRegistry,
    allow_duplicates: Arc<AtomicBool>,
    mailbox: Mailbox,
    operations: Option<mpsc::UnboundedSender<Operation>>,
    background: Vec<JoinHandle<()>>,
}

impl BtleplugPlatform {
    /// Open the adapter at `adapter_index` and start forwarding its events.
    ///
    /// When no usable adapter exists the platform still comes up and reports
    /// the radio as unsupported.
    pub async fn new(adapter_index: usize, mailbox: Mailbox) -> Self {
        let mut platform = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            allow_duplicates: Arc::new(AtomicBool::new(false)),
            mailbox,
            operations: None,
            background: Vec::new(),
        };

        match open_adapter(adapter_index).await {
            Ok(adapter) => {
                platform.spawn_event_pump(adapter.clone());
                platform.report_initial_state(&adapter).await;
                platform.spawn_worker(adapter);
            }
            Err(e) => {
                error!("Bluetooth unavailable: {:#}", e);
                post(
                    &platform.mailbox,
                    PlatformEvent::AdapterStateChanged(AdapterState::Unsupported),
                );
            }
        }

        platform
    }

    fn spawn_worker(&mut self, adapter: Adapter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            adapter,
            registry: self.registry.clone(),
            mailbox: self.mailbox.clone(),
        };
        self.background.push(tokio::spawn(worker.run(rx)));
        self.operations = Some(tx);
    }

    /// Later changes arrive as `StateUpdate` events.
    async fn report_initial_state(&self, adapter: &Adapter) {
        let state = match adapter.adapter_state().await {
            Ok(state) => map_central_state(state),
            Err(e) => {
                debug!("adapter_state() failed: {}", e);
                AdapterState::Unknown
            }
        };
        post(&self.mailbox, PlatformEvent::AdapterStateChanged(state));
    }

    fn spawn_event_pump(&mut self, adapter: Adapter) {
        let registry = self.registry.clone();
        let allow_duplicates = self.allow_duplicates.clone();
        let mailbox = self.mailbox.clone();

        self.background.push(tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Could not subscribe to adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let event = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        match describe_peripheral(&adapter, &registry, &allow_duplicates, &id)
                            .await
                        {
                            Some(event) => event,
                            None => continue,
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let handle = PeripheralHandle::new(id.to_string());
                        if !with_registry(&registry, |r| r.link_down(&handle)).unwrap_or(false) {
                            continue;
                        }
                        PlatformEvent::Disconnected {
                            peripheral: handle,
                            error: None,
                        }
                    }
                    CentralEvent::StateUpdate(state) => {
                        let state = map_central_state(state);
                        if !state.is_powered_on() {
                            with_registry(&registry, |r| r.adapter_lost());
                        }
                        PlatformEvent::AdapterStateChanged(state)
                    }
                    _ => continue,
                };

                if mailbox.send(SessionCommand::Platform(event)).is_err() {
                    break;
                }
            }
            debug!("Adapter event stream ended");
        }));
    }

    fn enqueue(&self, operation: Operation) {
        match &self.operations {
            Some(operations) => {
                if operations.send(operation).is_err() {
                    warn!("Bluetooth worker stopped, operation dropped");
                }
            }
            None => debug!("No adapter, operation dropped"),
        }
    }

    fn lookup(&self, handle: &PeripheralHandle) -> Option<Peripheral> {
        with_registry(&self.registry, |r| r.known.get(handle).cloned()).flatten()
    }

    fn find_characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> Option<(Peripheral, Characteristic)> {
        let peripheral = self.lookup(handle.peripheral())?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service.uuid)?;
        Some((peripheral, characteristic))
    }
}

impl BlePlatform for BtleplugPlatform {
    fn scan(&mut self, service: Uuid, allow_duplicates: bool) {
        self.allow_duplicates
            .store(allow_duplicates, Ordering::Relaxed);
        with_registry(&self.registry, |r| r.prune());
        self.enqueue(Operation::StartScan(service));
    }

    fn stop_scan(&mut self) {
        self.enqueue(Operation::StopScan);
    }

    fn connect(&mut self, handle: &PeripheralHandle) {
        match self.lookup(handle) {
            Some(peripheral) => self.enqueue(Operation::Connect(handle.clone(), peripheral)),
            None => post(
                &self.mailbox,
                PlatformEvent::Disconnected {
                    peripheral: handle.clone(),
                    error: Some("peripheral no longer known".to_string()),
                },
            ),
        }
    }

    fn disconnect(&mut self, handle: &PeripheralHandle) {
        match self.lookup(handle) {
            Some(peripheral) => self.enqueue(Operation::Disconnect(handle.clone(), peripheral)),
            // Live links are never pruned, so there is nothing to drop.
            None => post(
                &self.mailbox,
                PlatformEvent::Disconnected {
                    peripheral: handle.clone(),
                    error: None,
                },
            ),
        }
    }

    fn discover_services(&mut self, handle: &PeripheralHandle, services: &[Uuid]) {
        match self.lookup(handle) {
            Some(peripheral) => self.enqueue(Operation::DiscoverServices(
                handle.clone(),
                peripheral,
                services.to_vec(),
            )),
            None => post(
                &self.mailbox,
                PlatformEvent::ServicesDiscovered {
                    peripheral: handle.clone(),
                    services: Vec::new(),
                    error: Some("peripheral no longer known".to_string()),
                },
            ),
        }
    }

    fn discover_characteristics(&mut self, service: &ServiceHandle, characteristics: &[Uuid]) {
        // btleplug resolves characteristics together with services.
        let event = match self.lookup(&service.peripheral) {
            Some(peripheral) => match peripheral
                .services()
                .into_iter()
                .find(|s| s.uuid == service.uuid)
            {
                Some(resolved) => PlatformEvent::CharacteristicsDiscovered {
                    service: service.clone(),
                    characteristics: resolved
                        .characteristics
                        .iter()
                        .map(|c| c.uuid)
                        .filter(|uuid| characteristics.contains(uuid))
                        .collect(),
                    error: None,
                },
                None => PlatformEvent::CharacteristicsDiscovered {
                    service: service.clone(),
                    characteristics: Vec::new(),
                    error: Some(format!("service {} not resolved", service.uuid)),
                },
            },
            None => PlatformEvent::CharacteristicsDiscovered {
                service: service.clone(),
                characteristics: Vec::new(),
                error: Some("peripheral no longer known".to_string()),
            },
        };
        post(&self.mailbox, event);
    }

    fn write(&mut self, channel: &ChannelHandle, bytes: &[u8]) {
        match self.find_characteristic(channel) {
            Some((peripheral, characteristic)) => {
                self.enqueue(Operation::Write(peripheral, characteristic, bytes.to_vec()))
            }
            None => warn!("Write dropped, characteristic {} not found", channel.uuid),
        }
    }

    fn set_notify(&mut self, handle: &CharacteristicHandle, enabled: bool) {
        let Some((peripheral, characteristic)) = self.find_characteristic(handle) else {
            warn!("Notify skipped, characteristic {} not found", handle.uuid);
            return;
        };
        if enabled {
            self.enqueue(Operation::Subscribe(
                handle.peripheral().clone(),
                peripheral,
                characteristic,
            ));
        } else {
            if let Some(Some(task)) = with_registry(&self.registry, |r| {
                r.notify_tasks.remove(handle.peripheral())
            }) {
                task.abort();
            }
            self.enqueue(Operation::Unsubscribe(peripheral, characteristic));
        }
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        with_registry(&self.registry, |r| r.adapter_lost());
    }
}

async fn open_adapter(adapter_index: usize) -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .context("Failed to open the Bluetooth manager")?;
    let adapter = manager
        .adapters()
        .await
        .context("Failed to list Bluetooth adapters")?
        .into_iter()
        .nth(adapter_index)
        .ok_or_else(|| anyhow!("No Bluetooth adapter at index {}", adapter_index))?;

    match adapter.adapter_info().await {
        Ok(info) => info!("Using Bluetooth adapter: {}", info),
        Err(e) => debug!("adapter_info() failed: {}", e),
    }
    Ok(adapter)
}

/// Resolve a discovery event into a report, applying the duplicate filter.
async fn describe_peripheral(
    adapter: &Adapter,
    registry: &Mutex<Registry<Peripheral>>,
    allow_duplicates: &AtomicBool,
    id: &PeripheralId,
) -> Option<PlatformEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let name = match peripheral.properties().await {
        Ok(properties) => properties.and_then(|p| p.local_name),
        Err(e) => {
            trace!("No properties for {:?}: {}", id, e);
            None
        }
    };
    let handle = PeripheralHandle::new(id.to_string());

    let fresh = with_registry(registry, |r| {
        r.observe(
            handle.clone(),
            peripheral,
            name.is_some(),
            allow_duplicates.load(Ordering::Relaxed),
        )
    })?;
    if !fresh {
        return None;
    }

    Some(PlatformEvent::PeripheralDiscovered {
        peripheral: handle,
        name,
    })
}

type NotificationStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>>;

async fn open_notifications(
    peripheral: &Peripheral,
    characteristic: &Characteristic,
) -> Result<NotificationStream> {
    peripheral
        .subscribe(characteristic)
        .await
        .context("subscribe failed")?;
    let stream = peripheral
        .notifications()
        .await
        .context("no notification stream")?;
    info!("Notifications enabled on {}", characteristic.uuid);
    Ok(stream)
}

async fn forward_notifications(
    mut notifications: NotificationStream,
    characteristic: Uuid,
    owner: PeripheralHandle,
    mailbox: Mailbox,
) {
    while let Some(notification) = notifications.next().await {
        if notification.uuid != characteristic {
            continue;
        }
        let event = PlatformEvent::NotificationReceived {
            peripheral: owner.clone(),
            characteristic,
            value: notification.value,
        };
        if mailbox.send(SessionCommand::Platform(event)).is_err() {
            break;
        }
    }
}

fn post(mailbox: &Mailbox, event: PlatformEvent) {
    if mailbox.send(SessionCommand::Platform(event)).is_err() {
        debug!("Session closed, dropping platform event");
    }
}

fn map_central_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor() -> PeripheralHandle {
        PeripheralHandle::new("motor")
    }

    fn detached(
        mailbox: Mailbox,
    ) -> (BtleplugPlatform, mpsc::UnboundedReceiver<Operation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let platform = BtleplugPlatform {
            registry: Arc::new(Mutex::new(Registry::default())),
            allow_duplicates: Arc::new(AtomicBool::new(false)),
            mailbox,
            operations: Some(tx),
            background: Vec::new(),
        };
        (platform, rx)
    }

    #[test]
    fn test_operations_keep_call_order() {
        let (mailbox, _events) = mpsc::unbounded_channel();
        let (mut platform, mut operations) = detached(mailbox);
        let service = Uuid::from_u128(0x1234);

        platform.scan(service, false);
        platform.stop_scan();
        platform.scan(service, true);
        platform.stop_scan();

        assert!(matches!(operations.try_recv(), Ok(Operation::StartScan(s)) if s == service));
        assert!(matches!(operations.try_recv(), Ok(Operation::StopScan)));
        assert!(matches!(operations.try_recv(), Ok(Operation::StartScan(_))));
        assert!(matches!(operations.try_recv(), Ok(Operation::StopScan)));
        assert!(operations.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_of_unknown_peripheral_confirms_at_once() {
        let (mailbox, mut events) = mpsc::unbounded_channel();
        let (mut platform, mut operations) = detached(mailbox);

        platform.disconnect(&motor());

        assert!(operations.try_recv().is_err());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionCommand::Platform(PlatformEvent::Disconnected { peripheral, error: None }))
                if peripheral == motor()
        ));
    }

    #[test]
    fn test_map_central_state() {
        assert_eq!(
            map_central_state(CentralState::PoweredOn),
            AdapterState::PoweredOn
        );
        assert_eq!(
            map_central_state(CentralState::PoweredOff),
            AdapterState::PoweredOff
        );
        assert_eq!(
            map_central_state(CentralState::Unknown),
            AdapterState::Unknown
        );
    }

    #[test]
    fn test_link_down_reported_once() {
        let mut registry = Registry::<()>::default();
        assert!(!registry.link_down(&motor()));

        registry.link_up(&motor());
        assert!(registry.link_down(&motor()));
        assert!(!registry.link_down(&motor()));
    }

    #[test]
    fn test_adapter_loss_silences_links() {
        let mut registry = Registry::<()>::default();
        registry.link_up(&motor());
        registry.adapter_lost();
        assert!(!registry.link_down(&motor()));
    }

    #[test]
    fn test_prune_keeps_live_links() {
        let mut registry = Registry::<()>::default();
        let speaker = PeripheralHandle::new("speaker");
        registry.observe(motor(), (), true, false);
        registry.observe(speaker.clone(), (), true, false);
        registry.link_up(&motor());

        registry.prune();
        assert!(registry.known.contains_key(&motor()));
        assert!(!registry.known.contains_key(&speaker));
        assert!(registry.reported.is_empty());
    }

    #[test]
    fn test_duplicate_reports_filtered_until_named() {
        let mut registry = Registry::<()>::default();
        assert!(registry.observe(motor(), (), false, false));
        assert!(registry.observe(motor(), (), true, false));
        assert!(!registry.observe(motor(), (), true, false));
        assert!(registry.observe(motor(), (), true, true));
    }
}
