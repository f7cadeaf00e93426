//! BLE Service and Characteristic UUIDs.
//!
//! Contains the default target identity of the ConCure sensor firmware and
//! the standard GATT descriptor used to enable notifications.

use uuid::Uuid;

// Sensor Service (ConCure ESP32 firmware)
/// Default sensor service UUID.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x4faf_c201_1fb5_459e_8fcc_c5c9c331914b);
/// Default sensor characteristic UUID (Notify, Write).
pub const SENSOR_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5_483e_36e1_4688_b7f5_ea07361b26a8);

// Client Characteristic Configuration Descriptor (Standard BLE)
/// Standard CCCD UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications (little-endian 0x0001).
pub const NOTIFY_ENABLE_VALUE: [u8; 2] = [0x01, 0x00];

/// Default advertised-name signature of the sensor peripheral.
pub const DEFAULT_NAME_SIGNATURE: &str = "esp32";

/// Check whether an advertised service UUID string contains the target.
///
/// Comparison ignores case and hyphens, so short 16-bit forms and the
/// canonical 128-bit form of the same UUID compare the same way the
/// advertisement presents them.
pub fn uuid_matches(advertised: &str, target: &Uuid) -> bool {
    let normalize = |s: &str| -> String {
        s.chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };

    normalize(advertised).contains(&normalize(&target.to_string()))
}

/// Check whether an advertised name contains the signature (case-insensitive).
pub fn name_matches(advertised: &str, signature: &str) -> bool {
    !signature.is_empty()
        && advertised
            .to_lowercase()
            .contains(&signature.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SENSOR_SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            SENSOR_CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert!(CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string().contains("2902"));
    }

    #[test]
    fn test_uuid_matches_ignores_hyphens_and_case() {
        assert!(uuid_matches(
            "4FAFC2011FB5459E8FCCC5C9C331914B",
            &SENSOR_SERVICE_UUID
        ));
        assert!(uuid_matches(
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b",
            &SENSOR_SERVICE_UUID
        ));
        assert!(!uuid_matches(
            "0000180a-0000-1000-8000-00805f9b34fb",
            &SENSOR_SERVICE_UUID
        ));
    }

    #[test]
    fn test_name_matches() {
        assert!(name_matches("ESP32-ConCure", DEFAULT_NAME_SIGNATURE));
        assert!(name_matches("my esp32 board", "ESP32"));
        assert!(!name_matches("Thermometer", DEFAULT_NAME_SIGNATURE));
        assert!(!name_matches("anything", ""));
    }
}
