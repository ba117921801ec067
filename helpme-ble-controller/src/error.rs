//! Error types for the BLE controller.
//!
//! [`BackendError`] comes out of the BLE stack, [`LinkError`] out of the
//! [`LinkManager`](crate::LinkManager), and [`ProvisionError`] is what a
//! provisioning session ends with.

use uuid::Uuid;

pub use helpme_proto::CredentialsError as ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("bluetooth is turned off")]
    RadioOff,
    #[error("bluetooth adapter is already open")]
    AlreadyOpen,
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("bluetooth adapter is not open")]
    AdapterClosed,
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("service {0} not found")]
    UnknownService(Uuid),
    #[error("characteristic {0} not found")]
    UnknownCharacteristic(Uuid),
    #[error("timed out after {0:?}")]
    TimedOut(std::time::Duration),
    #[error(transparent)]
    Platform(#[from] btleplug::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to get device services: {0}")]
    Services(BackendError),
    #[error("no writable and readable characteristic pair found")]
    NoUsableCharacteristics,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("bluetooth is turned off")]
    RadioUnavailable,
    #[error("failed to open bluetooth adapter: {0}")]
    Adapter(BackendError),
    #[error("failed to start scan: {0}")]
    Scan(BackendError),
    #[error("failed to connect: {0}")]
    Connect(BackendError),
    #[error("no peripheral connected")]
    NotConnected,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("write failed: {0}")]
    Write(BackendError),
    #[error("read failed: {0}")]
    Read(BackendError),
}

/// Terminal failure of a provisioning session. The `Display` text is what
/// the user sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("bluetooth initialisation failed: {0}")]
    AdapterFailure(String),
    #[error("device scan failed: {0}")]
    ScanFailure(String),
    #[error("device not found, make sure it is powered on")]
    DiscoveryTimeout,
    #[error("failed to connect to device: {0}")]
    ConnectFailure(String),
    #[error("failed to get device services: {0}")]
    ServiceDiscoveryFailure(String),
    #[error("no usable characteristic found on device")]
    CharacteristicDiscoveryFailure,
    #[error("failed to send wifi configuration: {0}")]
    WriteFailure(String),
    #[error("failed to retrieve device info")]
    ResponseTimeout,
    #[error("failed to save device: {0}")]
    RegistrationFailure(String),
    #[error("no provisioning session is active")]
    NotStarted,
}
