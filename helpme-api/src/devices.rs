//! `GET /api/devices`

use serde::{Deserialize, Serialize};

use crate::http::{ApiClient, ApiError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedUser {
    pub id: String,
    pub name: String,
}

/// A device on the caller's account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub device_type_id: i64,
    pub status: i64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub shared_to: Vec<SharedUser>,
    #[serde(default)]
    pub active_alarm_count: u32,
}

impl Device {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

impl ApiClient {
    pub async fn list_devices(&self, token: Option<&str>) -> Result<Vec<Device>, ApiError> {
        let (status, body) = self
            .send(hyper::Method::GET, "/api/devices", token, None)
            .await?;
        if status != hyper::StatusCode::OK {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}
