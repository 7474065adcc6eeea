//! Command Dispatcher
//!
//! A pulse is a timed two-phase write: `ON` now, `OFF` after the pulse
//! delay. The pending `OFF` is a timer task that posts back into the session
//! mailbox, so the write itself is applied in order with every other event
//! and can be cancelled by a disconnect.

use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::platform::BlePlatform;
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::service::SessionCommand;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct CommandDispatcher {
    pulse_delay: Duration,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
    next_pulse_id: u64,
    pending: HashMap<u64, JoinHandle<()>>,
}

impl CommandDispatcher {
    pub fn new(pulse_delay: Duration, mailbox: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self {
            pulse_delay,
            mailbox,
            next_pulse_id: 0,
            pending: HashMap::new(),
        }
    }

    pub fn pending_pulses(&self) -> usize {
        self.pending.len()
    }

    /// Write `ON` and schedule the matching `OFF`.
    ///
    /// A silent no-op unless the session is Ready. Must be called from
    /// within a tokio runtime.
    pub fn trigger_pulse(
        &mut self,
        platform: &mut dyn BlePlatform,
        machine: &ConnectionStateMachine,
    ) -> bool {
        let Some(channel) = machine.channel() else {
            debug!("Pulse ignored, session is {:?}", machine.phase());
            return false;
        };

        platform.write(channel, Command::Activate.as_bytes());

        let pulse_id = self.next_pulse_id;
        self.next_pulse_id = self.next_pulse_id.wrapping_add(1);

        let delay = self.pulse_delay;
        let mailbox = self.mailbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if mailbox.send(SessionCommand::PulseElapsed(pulse_id)).is_err() {
                warn!("Session closed before pulse {} elapsed", pulse_id);
            }
        });
        self.pending.insert(pulse_id, timer);

        info!(
            "Pulse {} started: {} for {} ms",
            pulse_id,
            Command::Activate,
            delay.as_millis()
        );
        true
    }

    /// Write `OFF` for a pulse whose delay has elapsed, if it is still
    /// pending and the session is still Ready.
    pub fn on_pulse_elapsed(
        &mut self,
        platform: &mut dyn BlePlatform,
        machine: &ConnectionStateMachine,
        pulse_id: u64,
    ) -> bool {
        if self.pending.remove(&pulse_id).is_none() {
            debug!("Pulse {} was cancelled", pulse_id);
            return false;
        }
        let Some(channel) = machine.channel() else {
            debug!("Dropping OFF for pulse {}, session is {:?}", pulse_id, machine.phase());
            return false;
        };

        platform.write(channel, Command::Deactivate.as_bytes());
        info!("Pulse {} finished: {}", pulse_id, Command::Deactivate);
        true
    }

    /// Drop every pending `OFF`. Called whenever the channel goes away.
    pub fn cancel_all(&mut self) {
        for (pulse_id, timer) in self.pending.drain() {
            debug!("Cancelling pulse {}", pulse_id);
            timer.abort();
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DiscoveryFailure;
    use crate::infrastructure::bluetooth::platform::mock::{PlatformCall, RecordingPlatform};
    use crate::infrastructure::bluetooth::platform::{PeripheralHandle, ServiceHandle};
    use crate::infrastructure::bluetooth::protocol::{
        TargetDescriptor, NOTIFY_CHAR, SERVICE, WRITE_CHAR,
    };

    fn ready_machine(
        platform: &mut RecordingPlatform,
    ) -> Result<ConnectionStateMachine, DiscoveryFailure> {
        let target = TargetDescriptor::default();
        let peripheral = PeripheralHandle::new("motor");
        let mut machine = ConnectionStateMachine::new();
        machine.begin_scanning();
        machine.begin_connecting(peripheral.clone());
        machine.on_connected(platform, &target, &peripheral)?;
        machine.on_services_discovered(platform, &target, &peripheral, &[SERVICE], None)?;
        let service = ServiceHandle {
            peripheral,
            uuid: SERVICE,
        };
        machine.on_characteristics_discovered(
            platform,
            &target,
            &service,
            &[WRITE_CHAR, NOTIFY_CHAR],
            None,
        )?;
        platform.calls.clear();
        Ok(machine)
    }

    #[tokio::test]
    async fn test_pulse_when_not_ready_writes_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(Duration::from_millis(500), tx);
        let mut platform = RecordingPlatform::default();
        let machine = ConnectionStateMachine::new();

        assert!(!dispatcher.trigger_pulse(&mut platform, &machine));
        assert!(platform.calls.is_empty());
        assert_eq!(dispatcher.pending_pulses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_writes_on_then_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(Duration::from_millis(500), tx);
        let mut platform = RecordingPlatform::default();
        let machine = ready_machine(&mut platform).unwrap();

        let started = tokio::time::Instant::now();
        assert!(dispatcher.trigger_pulse(&mut platform, &machine));
        assert_eq!(platform.writes(), vec![b"ON".as_slice()]);
        assert!(matches!(
            platform.last(),
            Some(PlatformCall::Write(channel, _)) if channel.uuid == WRITE_CHAR
        ));

        let Some(SessionCommand::PulseElapsed(pulse_id)) = rx.recv().await else {
            panic!("expected pulse timer");
        };
        assert!(started.elapsed() >= Duration::from_millis(500));

        assert!(dispatcher.on_pulse_elapsed(&mut platform, &machine, pulse_id));
        assert_eq!(platform.writes(), vec![b"ON".as_slice(), b"OFF".as_slice()]);
        assert_eq!(dispatcher.pending_pulses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pulse_never_writes_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(Duration::from_millis(500), tx);
        let mut platform = RecordingPlatform::default();
        let machine = ready_machine(&mut platform).unwrap();

        dispatcher.trigger_pulse(&mut platform, &machine);
        tokio::time::advance(Duration::from_millis(200)).await;
        dispatcher.cancel_all();
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        assert!(!dispatcher.on_pulse_elapsed(&mut platform, &machine, 0));
        assert_eq!(platform.writes(), vec![b"ON".as_slice()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_after_link_loss_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(Duration::from_millis(500), tx);
        let mut platform = RecordingPlatform::default();
        let mut machine = ready_machine(&mut platform).unwrap();

        dispatcher.trigger_pulse(&mut platform, &machine);
        let Some(SessionCommand::PulseElapsed(pulse_id)) = rx.recv().await else {
            panic!("expected pulse timer");
        };
        machine.reset();

        assert!(!dispatcher.on_pulse_elapsed(&mut platform, &machine, pulse_id));
        assert_eq!(platform.writes(), vec![b"ON".as_slice()]);
    }
}
