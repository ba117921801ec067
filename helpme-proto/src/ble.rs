//! BLE advertising and GATT constants for HelpMe alarm provisioning
//!
//! The alarm firmware does not publish a fixed GATT layout, so only the
//! advertised name is pinned here. Services and characteristics are found at
//! connect time.

/// Advertised local name of an alarm waiting for Wi-Fi configuration
pub const TARGET_DEVICE_NAME: &str = "Xiao_Alarm_Config";

/// UUID prefix shared by Bluetooth SIG assigned (standard) services
pub const STANDARD_SERVICE_PREFIX: &str = "0000";

/// Whether a service UUID belongs to the Bluetooth SIG assigned range
/// (Generic Access, Device Information, Battery, ...).
pub fn is_standard_service(uuid: &str) -> bool {
    uuid.starts_with(STANDARD_SERVICE_PREFIX)
}

/// Text commands written to the device's command characteristic
pub mod commands {
    /// Push Wi-Fi credentials: `setwifi:<ssid>|<password>`
    pub const SET_WIFI: &str = "setwifi:";

    /// Separates SSID and password inside [`SET_WIFI`]
    pub const CREDENTIAL_SEPARATOR: char = '|';

    /// Ask the device for `<deviceTypeId>,<macAddress>,<readyFlag>`
    pub const GET_INFO: &str = "getinfo";

    /// Separates fields of the `getinfo` response
    pub const FIELD_SEPARATOR: char = ',';
}
