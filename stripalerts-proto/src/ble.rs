//! BLE GATT Service Protocol Constants for StripAlerts Device Provisioning
//!
//! This module defines the service and characteristic UUIDs, the advertised
//! name prefix, and the command/status tokens exchanged over the six
//! provisioning channels.

/// BLE Service UUID: 6e400001-b5a3-f393-e0a9-e50e24dcca9e
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// WiFi SSID Characteristic UUID (write, chunked)
pub const WIFI_SSID_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// WiFi Password Characteristic UUID (write, chunked)
pub const WIFI_PASS_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Event API URL Characteristic UUID (write, chunked)
pub const API_URL_UUID: &str = "6e400004-b5a3-f393-e0a9-e50e24dcca9e";

/// Status Characteristic UUID (read/notify)
pub const STATUS_UUID: &str = "6e400005-b5a3-f393-e0a9-e50e24dcca9e";

/// Network scan result Characteristic UUID (read/notify, JSON)
pub const NETWORKS_UUID: &str = "6e400006-b5a3-f393-e0a9-e50e24dcca9e";

/// WiFi test / save control Characteristic UUID (read/write/notify)
pub const WIFI_TEST_UUID: &str = "6e400007-b5a3-f393-e0a9-e50e24dcca9e";

/// Name the peripheral advertises while in provisioning mode.
pub const DEVICE_NAME: &str = "StripAlerts-Setup";

/// Discovery matches any advertised name starting with this prefix.
pub const DEVICE_NAME_PREFIX: &str = "StripAlerts";

/// Returns true if an advertised name belongs to a StripAlerts peripheral.
///
/// Matches "StripAlerts-xxx" as well as the "nimble [StripAlerts-xxx]" form
/// some host stacks report.
pub fn matches_prefix(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix) || name.contains(&format!("[{prefix}"))
}

/// Commands written to the wifiTest channel
pub mod commands {
    /// Connect to the configured network and report "success" or "failed"
    pub const TEST: &str = "test";

    /// Scan again and publish a fresh networks list
    pub const RESCAN: &str = "rescan";

    /// Persist ssid/password/apiUrl and reboot
    pub const SAVE: &str = "save";
}

/// Results published on the wifiTest channel
pub mod results {
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}

/// Texts published on the status channel
pub mod status {
    /// The peripheral accepts user interaction
    pub const READY: &str = "Ready";
    pub const SCANNING: &str = "Scanning Networks...";
    pub const SCAN_COMPLETE: &str = "Scan Complete";
    pub const TESTING: &str = "Testing WiFi...";
    /// Prefix of a failed WiFi test
    pub const WIFI_FAILED: &str = "WiFi failed";
    /// Save accepted, in progress
    pub const SAVING: &str = "Saving";
    /// Save committed, the peripheral reboots next
    pub const SAVED: &str = "Saved";
    /// Prefix of a rejected save, e.g. "Save failed: missing fields"
    pub const SAVE_FAILED: &str = "Save failed";
}

/// One of the six provisioning channels exposed by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ssid,
    Password,
    ApiUrl,
    Status,
    Networks,
    WifiTest,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Ssid,
        Channel::Password,
        Channel::ApiUrl,
        Channel::Status,
        Channel::Networks,
        Channel::WifiTest,
    ];

    /// Channels the controller subscribes to right after connecting.
    pub const NOTIFY: [Channel; 3] = [Channel::Status, Channel::Networks, Channel::WifiTest];

    pub fn uuid(&self) -> &'static str {
        match self {
            Channel::Ssid => WIFI_SSID_UUID,
            Channel::Password => WIFI_PASS_UUID,
            Channel::ApiUrl => API_URL_UUID,
            Channel::Status => STATUS_UUID,
            Channel::Networks => NETWORKS_UUID,
            Channel::WifiTest => WIFI_TEST_UUID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Ssid => "ssid",
            Channel::Password => "password",
            Channel::ApiUrl => "apiUrl",
            Channel::Status => "status",
            Channel::Networks => "networks",
            Channel::WifiTest => "wifiTest",
        }
    }

    pub fn from_uuid(uuid: &str) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }

    /// Channels written with the chunked Start/Append protocol.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Channel::Ssid | Channel::Password | Channel::ApiUrl | Channel::WifiTest
        )
    }

    /// Values on this channel must never be logged in clear.
    pub fn is_secret(&self) -> bool {
        matches!(self, Channel::Password)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
