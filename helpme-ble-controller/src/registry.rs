//! Hand-off from a provisioned device to the account backend

use helpme_proto::DeviceIdentity;

/// Outcome of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The backend already knew this device. Still a success.
    AlreadyRegistered,
}

pub type RegistryError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait::async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn register(&self, identity: &DeviceIdentity) -> Result<Registration, RegistryError>;

    /// Re-fetch the caller's device list after a session finishes.
    async fn refresh_devices(&self) -> Result<(), RegistryError>;
}
