//! Provisioning state machine
//!
//! [`Machine`] is a plain value: every operation takes the current state and
//! an input and returns the side effects to perform as a list of
//! [`Command`]s. It never touches the radio, a timer or the network itself;
//! the [`Provisioner`](crate::Provisioner) runs the commands and feeds their
//! outcomes back in as [`Event`]s.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> SendingCredentials -> AwaitingDeviceInfo
//!                                                              |
//!                                      Done / Error <- Registering
//! ```
//!
//! Any state can fall into `Error`; `reset` returns to `Idle` from anywhere.

use std::time::Duration;

use helpme_proto::ble::TARGET_DEVICE_NAME;
use helpme_proto::{Credentials, DeviceIdentity, DeviceInfo, encode, get_info_command};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::discovery::Selection;
use crate::error::{ProvisionError, ValidationError};
use crate::gatt::{CharacteristicRef, PeripheralId};
use crate::registry::Registration;

/// Protocol timing and the device to look for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Advertised name matched exactly during the scan
    pub target_name: String,
    pub scan_window: Duration,
    /// Pause between connecting and walking the GATT table
    pub connect_settle: Duration,
    /// Pause between the credentials write and the first poll
    pub credential_settle: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Bound on a single connect, discovery, write or read
    pub operation_timeout: Duration,
    pub registration_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            target_name: TARGET_DEVICE_NAME.to_string(),
            scan_window: Duration::from_secs(15),
            connect_settle: Duration::from_millis(500),
            credential_settle: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 30,
            operation_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    ScanWindow,
    ConnectSettle,
    CredentialSettle,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePurpose {
    /// The one-off `setwifi` write; failure ends the session
    Credentials,
    /// A `getinfo` query; failure is tolerated
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterFailure {
    RadioOff,
    Failed(String),
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AdapterReady,
    AdapterFailed(AdapterFailure),
    RadioStateChanged { available: bool },
    ScanFailed(String),
    DeviceFound { peripheral: PeripheralId, name: String },
    TimerFired(Timer),
    Connected,
    ConnectFailed(String),
    CharacteristicsFound(Selection),
    ServicesUnavailable(String),
    NoUsableCharacteristics,
    WriteFinished {
        purpose: WritePurpose,
        result: Result<(), String>,
    },
    ValueReceived(Vec<u8>),
    RegistrationFinished(Result<Registration, String>),
}

/// An event stamped with the session that caused it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub epoch: u64,
    pub event: Event,
}

/// Sending half of the provisioner's inbox, bound to one session.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
    epoch: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn send(&self, event: Event) {
        let envelope = Envelope {
            epoch: self.epoch,
            event,
        };
        if self.tx.send(envelope).is_err() {
            debug!("provisioner gone, dropping event");
        }
    }
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenAdapter,
    WatchRadio,
    StartScan { target: String },
    StopScan,
    ArmTimer { timer: Timer, after: Duration },
    CancelTimer(Timer),
    CancelTimers,
    Connect(PeripheralId),
    DiscoverCharacteristics,
    Write {
        characteristic: CharacteristicRef,
        payload: Vec<u8>,
        purpose: WritePurpose,
    },
    Read { characteristic: CharacteristicRef },
    Disconnect,
    Teardown,
    Register(DeviceIdentity),
    RefreshDevices,
    Report(Report),
}

/// Status surfaced to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Progress(String),
    Done(String),
    Failed(ProvisionError),
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Report::Progress(message) | Report::Done(message) => f.write_str(message),
            Report::Failed(error) => write!(f, "{error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Idle,
    Scanning {
        credentials: Credentials,
        /// Discovery is running and the scan window is armed
        started: bool,
    },
    Connecting {
        credentials: Credentials,
        peripheral: PeripheralId,
    },
    SendingCredentials {
        link: Selection,
    },
    AwaitingDeviceInfo {
        link: Selection,
        attempts: u32,
    },
    Registering {
        identity: DeviceIdentity,
    },
    Done {
        summary: String,
    },
    Error {
        error: ProvisionError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Idle,
    Scanning,
    Connecting,
    SendingCredentials,
    AwaitingDeviceInfo,
    Registering,
    Done,
    Error,
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Idle => StateKind::Idle,
            State::Scanning { .. } => StateKind::Scanning,
            State::Connecting { .. } => StateKind::Connecting,
            State::SendingCredentials { .. } => StateKind::SendingCredentials,
            State::AwaitingDeviceInfo { .. } => StateKind::AwaitingDeviceInfo,
            State::Registering { .. } => StateKind::Registering,
            State::Done { .. } => StateKind::Done,
            State::Error { .. } => StateKind::Error,
        }
    }

    /// A session is in progress and owns link resources
    pub fn is_active(&self) -> bool {
        !matches!(self, State::Idle | State::Done { .. } | State::Error { .. })
    }
}

type Transition = (State, Vec<Command>);

pub struct Machine {
    config: ProvisionConfig,
    state: State,
    epoch: u64,
}

impl Machine {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            epoch: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Session counter; bumped by every `start` and `reset`
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Begin a new session. Blank credentials are rejected and leave the
    /// machine untouched; a session already in progress is torn down first.
    pub fn start(&mut self, ssid: &str, password: &str) -> Result<Vec<Command>, ValidationError> {
        let credentials = Credentials::new(ssid, password)?;

        let mut commands = Vec::new();
        if self.state.is_active() {
            info!("replacing active provisioning session");
            commands.extend([Command::CancelTimers, Command::Teardown]);
        }

        self.epoch += 1;
        info!("provisioning session {} started for {:?}", self.epoch, credentials.ssid());
        self.state = State::Scanning {
            credentials,
            started: false,
        };
        commands.extend([
            progress("scanning for device..."),
            Command::OpenAdapter,
        ]);
        Ok(commands)
    }

    /// Abandon whatever is in progress and go back to `Idle`.
    pub fn reset(&mut self) -> Vec<Command> {
        self.epoch += 1;
        if self.state.kind() != StateKind::Idle {
            info!("provisioning: {:?} -> Idle (reset)", self.state.kind());
        }
        self.state = State::Idle;
        vec![Command::CancelTimers, Command::Teardown]
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        let from = self.state.kind();
        let state = std::mem::replace(&mut self.state, State::Idle);
        let (next, commands) = self.transition(state, event);
        if next.kind() != from {
            info!("provisioning: {from:?} -> {:?}", next.kind());
        }
        self.state = next;
        commands
    }

    fn transition(&self, state: State, event: Event) -> Transition {
        match (state, event) {
            // Scanning
            (
                State::Scanning {
                    credentials,
                    started: false,
                },
                Event::AdapterReady,
            ) => (
                State::Scanning {
                    credentials,
                    started: true,
                },
                vec![
                    Command::StartScan {
                        target: self.config.target_name.clone(),
                    },
                    Command::ArmTimer {
                        timer: Timer::ScanWindow,
                        after: self.config.scan_window,
                    },
                ],
            ),
            (s @ State::Scanning { .. }, Event::AdapterFailed(AdapterFailure::RadioOff)) => (
                s,
                vec![
                    progress("bluetooth is off, waiting for it to be turned on..."),
                    Command::WatchRadio,
                ],
            ),
            (State::Scanning { .. }, Event::AdapterFailed(AdapterFailure::Failed(reason))) => {
                fail(ProvisionError::AdapterFailure(reason), [])
            }
            (
                s @ State::Scanning { started: false, .. },
                Event::RadioStateChanged { available: true },
            ) => (s, vec![Command::OpenAdapter]),
            (State::Scanning { .. }, Event::ScanFailed(reason)) => {
                fail(ProvisionError::ScanFailure(reason), [])
            }
            (State::Scanning { credentials, .. }, Event::DeviceFound { peripheral, name })
                if name == self.config.target_name =>
            {
                let commands = vec![
                    Command::StopScan,
                    Command::CancelTimer(Timer::ScanWindow),
                    progress(format!("found {name}, connecting...")),
                    Command::Connect(peripheral.clone()),
                ];
                (
                    State::Connecting {
                        credentials,
                        peripheral,
                    },
                    commands,
                )
            }
            (State::Scanning { .. }, Event::TimerFired(Timer::ScanWindow)) => {
                fail(ProvisionError::DiscoveryTimeout, [])
            }

            // Connecting
            (s @ State::Connecting { .. }, Event::Connected) => (
                s,
                vec![
                    progress("connected, discovering services..."),
                    Command::ArmTimer {
                        timer: Timer::ConnectSettle,
                        after: self.config.connect_settle,
                    },
                ],
            ),
            (State::Connecting { .. }, Event::ConnectFailed(reason)) => {
                fail(ProvisionError::ConnectFailure(reason), [])
            }
            (s @ State::Connecting { .. }, Event::TimerFired(Timer::ConnectSettle)) => {
                (s, vec![Command::DiscoverCharacteristics])
            }
            (State::Connecting { .. }, Event::ServicesUnavailable(reason)) => {
                fail(ProvisionError::ServiceDiscoveryFailure(reason), [])
            }
            (State::Connecting { .. }, Event::NoUsableCharacteristics) => {
                fail(ProvisionError::CharacteristicDiscoveryFailure, [])
            }
            (State::Connecting { credentials, .. }, Event::CharacteristicsFound(link)) => {
                let commands = vec![
                    progress("sending wifi configuration..."),
                    Command::Write {
                        characteristic: link.write.clone(),
                        payload: encode(&credentials.to_command()),
                        purpose: WritePurpose::Credentials,
                    },
                ];
                (State::SendingCredentials { link }, commands)
            }

            // SendingCredentials
            (
                State::SendingCredentials { link },
                Event::WriteFinished {
                    purpose: WritePurpose::Credentials,
                    result,
                },
            ) => match result {
                Ok(()) => {
                    let commands = vec![
                        query(&link),
                        Command::ArmTimer {
                            timer: Timer::CredentialSettle,
                            after: self.config.credential_settle,
                        },
                    ];
                    (State::SendingCredentials { link }, commands)
                }
                Err(reason) => fail(ProvisionError::WriteFailure(reason), []),
            },
            (State::SendingCredentials { link }, Event::TimerFired(Timer::CredentialSettle)) => (
                State::AwaitingDeviceInfo { link, attempts: 0 },
                vec![
                    progress("waiting for device info..."),
                    Command::ArmTimer {
                        timer: Timer::Poll,
                        after: self.config.poll_interval,
                    },
                ],
            ),

            // AwaitingDeviceInfo
            (State::AwaitingDeviceInfo { link, attempts }, Event::TimerFired(Timer::Poll)) => {
                let attempts = attempts + 1;
                let mut commands = vec![
                    query(&link),
                    Command::Read {
                        characteristic: link.read.clone(),
                    },
                ];
                debug!("device info poll {attempts}/{}", self.config.max_poll_attempts);
                if attempts >= self.config.max_poll_attempts {
                    let (state, rest) = fail(ProvisionError::ResponseTimeout, [Command::Disconnect]);
                    commands.extend(rest);
                    return (state, commands);
                }
                commands.push(Command::ArmTimer {
                    timer: Timer::Poll,
                    after: self.config.poll_interval,
                });
                (State::AwaitingDeviceInfo { link, attempts }, commands)
            }
            (State::AwaitingDeviceInfo { link, attempts }, Event::ValueReceived(value)) => {
                let waiting = State::AwaitingDeviceInfo { link, attempts };
                match DeviceInfo::from_bytes(&value) {
                    Err(e) => {
                        debug!("ignoring response {:?}: {e}", helpme_proto::decode(&value));
                        (waiting, vec![])
                    }
                    Ok(info) if !info.ready => (
                        waiting,
                        vec![progress("waiting for device to join the network...")],
                    ),
                    Ok(DeviceInfo { identity, .. }) => {
                        let commands = vec![
                            Command::CancelTimer(Timer::Poll),
                            progress(format!("device {identity} is online, registering...")),
                            Command::Register(identity.clone()),
                        ];
                        (State::Registering { identity }, commands)
                    }
                }
            }

            // Registering
            (State::Registering { identity }, Event::RegistrationFinished(outcome)) => {
                let (state, report) = match outcome {
                    Ok(Registration::Created) => {
                        let summary = format!("device {identity} registered");
                        (State::Done { summary: summary.clone() }, Report::Done(summary))
                    }
                    Ok(Registration::AlreadyRegistered) => {
                        let summary = format!("device {identity} was already registered");
                        (State::Done { summary: summary.clone() }, Report::Done(summary))
                    }
                    Err(reason) => {
                        warn!("registration of {identity} failed: {reason}");
                        let error = ProvisionError::RegistrationFailure(reason);
                        (State::Error { error: error.clone() }, Report::Failed(error))
                    }
                };
                (
                    state,
                    vec![
                        Command::CancelTimers,
                        Command::Disconnect,
                        Command::Teardown,
                        Command::RefreshDevices,
                        Command::Report(report),
                    ],
                )
            }

            (state, event) => {
                debug!("{:?} ignores {event:?}", state.kind());
                (state, vec![])
            }
        }
    }
}

fn progress(message: impl Into<String>) -> Command {
    Command::Report(Report::Progress(message.into()))
}

fn query(link: &Selection) -> Command {
    Command::Write {
        characteristic: link.write.clone(),
        payload: encode(get_info_command()),
        purpose: WritePurpose::Query,
    }
}

/// Enter `Error`: stop timers, run `before`, tear the link down, report.
fn fail<const N: usize>(error: ProvisionError, before: [Command; N]) -> Transition {
    warn!("provisioning failed: {error}");
    let mut commands = vec![Command::CancelTimers];
    commands.extend(before);
    commands.push(Command::Teardown);
    commands.push(Command::Report(Report::Failed(error.clone())));
    (State::Error { error }, commands)
}
