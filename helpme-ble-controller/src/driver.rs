//! Async driver for the provisioning state machine
//!
//! The [`Provisioner`] owns the [`Machine`], the [`LinkManager`] and the
//! session timers. It runs commands in order, one at a time, and every
//! outcome comes back through a single channel as an [`Envelope`]. Events
//! stamped with an older session's epoch are dropped.
//!
//! Nothing the loop awaits is unbounded: link operations carry the
//! configured operation timeout, characteristic writes and reads are queued
//! on the link, and registration gets its own timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::{
    AdapterFailure, Command, Envelope, Event, EventSink, Machine, ProvisionConfig, Report, State,
    Timer,
};
use crate::error::{DiscoveryError, LinkError, ProvisionError, ValidationError};
use crate::link::{BleBackend, LinkManager};
use crate::registry::DeviceRegistry;

/// Where status reports go
pub trait StatusSink: Send {
    fn report(&mut self, report: &Report);
}

impl StatusSink for mpsc::UnboundedSender<Report> {
    fn report(&mut self, report: &Report) {
        if self.send(report.clone()).is_err() {
            debug!("status receiver gone");
        }
    }
}

/// Armed one-shot timers; each fires at most once.
#[derive(Default)]
struct Timers {
    armed: HashMap<Timer, JoinHandle<()>>,
}

impl Timers {
    fn arm(&mut self, timer: Timer, after: Duration, sink: EventSink) {
        self.cancel(timer);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            sink.send(Event::TimerFired(timer));
        });
        self.armed.insert(timer, handle);
    }

    fn cancel(&mut self, timer: Timer) {
        if let Some(handle) = self.armed.remove(&timer) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

pub struct Provisioner<B: BleBackend, R: DeviceRegistry, S: StatusSink> {
    machine: Machine,
    link: LinkManager<B>,
    registry: R,
    status: S,
    timers: Timers,
    registration_timeout: Duration,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl<B: BleBackend, R: DeviceRegistry, S: StatusSink> Provisioner<B, R, S> {
    pub fn new(backend: Arc<B>, registry: R, status: S, config: ProvisionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            link: LinkManager::new(backend).with_timeout(config.operation_timeout),
            registration_timeout: config.registration_timeout,
            machine: Machine::new(config),
            registry,
            status,
            timers: Timers::default(),
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &State {
        self.machine.state()
    }

    pub fn epoch(&self) -> u64 {
        self.machine.epoch()
    }

    /// Subscriptions currently held on the BLE stack
    pub fn listener_count(&self) -> usize {
        self.link.listener_count()
    }

    /// A sink stamped with the current session
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.tx.clone(), self.machine.epoch())
    }

    pub async fn start(&mut self, ssid: &str, password: &str) -> Result<(), ValidationError> {
        let commands = self.machine.start(ssid, password)?;
        self.execute(commands).await;
        Ok(())
    }

    pub async fn reset(&mut self) {
        let commands = self.machine.reset();
        self.execute(commands).await;
    }

    /// Wait for one event and process it.
    pub async fn step(&mut self) {
        if let Some(envelope) = self.rx.recv().await {
            self.dispatch(envelope).await;
        }
    }

    /// Process events until the session ends.
    pub async fn run(&mut self) -> Result<String, ProvisionError> {
        loop {
            match self.machine.state() {
                State::Idle => return Err(ProvisionError::NotStarted),
                State::Done { summary } => return Ok(summary.clone()),
                State::Error { error } => return Err(error.clone()),
                _ => self.step().await,
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        if envelope.epoch != self.machine.epoch() {
            debug!(
                "dropping {:?} from session {} (current {})",
                envelope.event,
                envelope.epoch,
                self.machine.epoch()
            );
            return;
        }
        let commands = self.machine.handle(envelope.event);
        self.execute(commands).await;
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            self.run_command(command).await;
        }
    }

    async fn run_command(&mut self, command: Command) {
        let sink = self.sink();
        match command {
            Command::OpenAdapter => match self.link.open().await {
                Ok(()) => sink.send(Event::AdapterReady),
                Err(LinkError::RadioUnavailable) => {
                    sink.send(Event::AdapterFailed(AdapterFailure::RadioOff))
                }
                Err(e) => sink.send(Event::AdapterFailed(AdapterFailure::Failed(reason(e)))),
            },
            Command::WatchRadio => self.link.watch_radio(sink),
            Command::StartScan { target } => {
                if let Err(e) = self.link.scan(&target, sink.clone()).await {
                    sink.send(Event::ScanFailed(reason(e)));
                }
            }
            Command::StopScan => self.link.stop_scan().await,
            Command::ArmTimer { timer, after } => self.timers.arm(timer, after, sink),
            Command::CancelTimer(timer) => self.timers.cancel(timer),
            Command::CancelTimers => self.timers.cancel_all(),
            Command::Connect(peripheral) => match self.link.connect(&peripheral).await {
                Ok(_) => sink.send(Event::Connected),
                Err(e) => sink.send(Event::ConnectFailed(reason(e))),
            },
            Command::DiscoverCharacteristics => match self.link.discover(sink.clone()).await {
                Ok(selection) => sink.send(Event::CharacteristicsFound(selection)),
                Err(LinkError::Discovery(DiscoveryError::NoUsableCharacteristics)) => {
                    sink.send(Event::NoUsableCharacteristics)
                }
                Err(e) => sink.send(Event::ServicesUnavailable(reason(e))),
            },
            Command::Write {
                characteristic,
                payload,
                purpose,
            } => {
                if let Err(e) = self
                    .link
                    .queue_write(&characteristic, payload, purpose, sink.clone())
                {
                    debug!("{purpose:?} write not sent: {e}");
                    sink.send(Event::WriteFinished {
                        purpose,
                        result: Err(reason(e)),
                    });
                }
            }
            Command::Read { characteristic } => {
                if let Err(e) = self.link.queue_read(&characteristic, sink) {
                    debug!("read not sent: {e}");
                }
            }
            Command::Disconnect => self.link.disconnect().await,
            Command::Teardown => self.link.teardown().await,
            Command::Register(identity) => {
                let limit = self.registration_timeout;
                let outcome = match tokio::time::timeout(limit, self.registry.register(&identity)).await {
                    Ok(outcome) => outcome.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("timed out after {limit:?}")),
                };
                sink.send(Event::RegistrationFinished(outcome));
            }
            Command::RefreshDevices => {
                let limit = self.registration_timeout;
                match tokio::time::timeout(limit, self.registry.refresh_devices()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("failed to refresh device list: {e}"),
                    Err(_) => warn!("device list refresh timed out after {limit:?}"),
                }
            }
            Command::Report(report) => self.status.report(&report),
        }
    }
}

/// The underlying cause of a link failure, without the link-level prefix
fn reason(error: LinkError) -> String {
    match error {
        LinkError::Adapter(e)
        | LinkError::Scan(e)
        | LinkError::Connect(e)
        | LinkError::Write(e)
        | LinkError::Read(e)
        | LinkError::Discovery(DiscoveryError::Services(e)) => e.to_string(),
        other => other.to_string(),
    }
}
