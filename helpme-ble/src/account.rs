//! Registers provisioned devices with the account backend

use helpme_api::{ApiClient, RegisterOutcome};
use helpme_ble_controller::registry::RegistryError;
use helpme_ble_controller::{DeviceRegistry, Registration};
use helpme_proto::DeviceIdentity;

pub struct ApiRegistry {
    client: ApiClient,
    token: Option<String>,
}

impl ApiRegistry {
    pub fn new(client: ApiClient, token: Option<String>) -> Self {
        Self { client, token }
    }
}

pub fn registration(outcome: RegisterOutcome) -> Registration {
    match outcome {
        RegisterOutcome::Created => Registration::Created,
        RegisterOutcome::AlreadyExists => Registration::AlreadyRegistered,
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for ApiRegistry {
    async fn register(&self, identity: &DeviceIdentity) -> Result<Registration, RegistryError> {
        let outcome = self
            .client
            .register(
                identity.device_type_id,
                &identity.mac_address,
                self.token.as_deref(),
            )
            .await?;
        Ok(registration(outcome))
    }

    async fn refresh_devices(&self) -> Result<(), RegistryError> {
        let devices = self.client.list_devices(self.token.as_deref()).await?;
        crate::print_devices(&devices);
        Ok(())
    }
}
