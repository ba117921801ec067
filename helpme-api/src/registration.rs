//! `POST /api/devices`

use helpme_proto::DeviceIdentity;

use crate::http::{ApiClient, ApiError};

/// Status the backend answers with when the device is already on record
pub const ALREADY_EXISTS: u16 = 419;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyExists,
}

pub fn outcome(status: hyper::StatusCode) -> Result<RegisterOutcome, ApiError> {
    if status.is_success() {
        Ok(RegisterOutcome::Created)
    } else if status.as_u16() == ALREADY_EXISTS {
        Ok(RegisterOutcome::AlreadyExists)
    } else {
        Err(ApiError::Status(status.as_u16()))
    }
}

impl ApiClient {
    /// Attach a freshly provisioned device to the caller's account.
    pub async fn register(
        &self,
        device_type_id: i64,
        mac_address: &str,
        token: Option<&str>,
    ) -> Result<RegisterOutcome, ApiError> {
        let body = serde_json::to_vec(&DeviceIdentity {
            device_type_id,
            mac_address: mac_address.to_string(),
        })?;
        let (status, _) = self
            .send(hyper::Method::POST, "/api/devices", token, Some(body))
            .await?;
        let result = outcome(status);
        log::info!("register {mac_address} (type {device_type_id}): {status}");
        result
    }
}
