//! HelpMe wire protocol - commands and responses exchanged with an alarm
//! device over a BLE characteristic

pub mod ble;
mod codec;

pub use codec::{decode, encode};

use ble::commands;

/// Wi-Fi credentials to push to a device. Both fields are stored trimmed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("wifi name is required")]
    EmptySsid,
    #[error("wifi password is required")]
    EmptyPassword,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, CredentialsError> {
        let ssid = ssid.trim();
        let password = password.trim();
        if ssid.is_empty() {
            return Err(CredentialsError::EmptySsid);
        }
        if password.is_empty() {
            return Err(CredentialsError::EmptyPassword);
        }
        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// The `setwifi:<ssid>|<password>` command
    pub fn to_command(&self) -> String {
        format!(
            "{}{}{}{}",
            commands::SET_WIFI,
            self.ssid,
            commands::CREDENTIAL_SEPARATOR,
            self.password
        )
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Network identity reported by a device, ready to be registered
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_type_id: i64,
    /// Lowercase hex without separators, e.g. `aabbccddeeff`
    pub mac_address: String,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (type {})", self.mac_address, self.device_type_id)
    }
}

/// Parsed `getinfo` response: `<deviceTypeId>,<macAddress>,<readyFlag>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    /// Device has joined the Wi-Fi network (`readyFlag == 1`)
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected at least 3 fields, got {0}")]
    TooFewFields(usize),
    #[error("invalid device type: {0:?}")]
    InvalidDeviceType(String),
    #[error("empty mac address")]
    EmptyMacAddress,
}

impl DeviceInfo {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = text
            .trim()
            .split(commands::FIELD_SEPARATOR)
            .map(str::trim)
            .collect();
        if fields.len() < 3 {
            return Err(ParseError::TooFewFields(fields.len()));
        }

        let device_type_id = parse_device_type(fields[0])
            .ok_or_else(|| ParseError::InvalidDeviceType(fields[0].to_string()))?;

        let mac_address = normalize_mac(fields[1]);
        if mac_address.is_empty() {
            return Err(ParseError::EmptyMacAddress);
        }

        // anything other than 1, including garbage, means "not joined yet"
        let ready = fields[2].parse::<f64>().is_ok_and(|flag| flag == 1.0);

        Ok(Self {
            identity: DeviceIdentity {
                device_type_id,
                mac_address,
            },
            ready,
        })
    }

    /// Parse a raw characteristic value
    pub fn from_bytes(value: &[u8]) -> Result<Self, ParseError> {
        Self::parse(&decode(value))
    }
}

fn parse_device_type(field: &str) -> Option<i64> {
    if let Ok(id) = field.parse::<i64>() {
        return Some(id);
    }
    let n = field.parse::<f64>().ok()?;
    if !n.is_finite() || n.fract() != 0.0 || n.abs() > i64::MAX as f64 {
        return None;
    }
    Some(n as i64)
}

/// Strip colon separators and lowercase: `AA:bb:CC:dd:EE:ff` -> `aabbccddeeff`
pub fn normalize_mac(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|&c| c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// The `getinfo` command
pub fn get_info_command() -> &'static str {
    commands::GET_INFO
}
