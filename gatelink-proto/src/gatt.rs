//! GATT services, characteristics and byte codes spoken by the edge firmware

use uuid::Uuid;

/// Client Characteristic Configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

// Mutual authentication service and its characteristics
pub const MUTUAL_AUTH_SERVICE: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff00);
/// 1-byte stage selector (write)
pub const WRITE_DATA_INDICATION: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff01);
/// Chunked gateway parameter (write)
pub const WRITE_DATA_PARAM_VALUE: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff02);
/// 1-byte edge verdict on our parameters (read/notify)
pub const GATEWAY_STATUS: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff03);
/// Chunked edge parameter (read)
pub const EDGE_PARAM_VALUE: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff04);
/// 1-byte gateway verdict on edge parameters (write)
pub const EDGE_STATUS: Uuid = Uuid::from_u128(0xc6f2d9e3_49e7_4125_9014_bfc6d669ff05);

// Device information service, all values ASCII
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff00);
pub const AFR_VERSION: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff01);
pub const BROKER_ENDPOINT: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff02);
pub const MTU: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff03);
pub const PLATFORM: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff04);
pub const DEVICE_ID: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff05);

// MQTT proxy service
pub const MQTT_PROXY_SERVICE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30000);
pub const MQTT_PROXY_CONTROL: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30001);
pub const MQTT_PROXY_TX: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30002);
pub const MQTT_PROXY_RX: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30003);
pub const MQTT_PROXY_TX_LARGE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30004);
pub const MQTT_PROXY_RX_LARGE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30005);

// Network configuration service
pub const NETWORK_SERVICE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30100);
pub const NETWORK_CONTROL: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30101);
pub const NETWORK_TX: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30102);
pub const NETWORK_RX: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30103);
pub const NETWORK_TX_LARGE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30104);
pub const NETWORK_RX_LARGE: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30105);

/// Value written to a proxy control characteristic to switch it on
pub const CONTROL_ENABLE: u8 = 0x01;

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];

/// Stage selectors written to WRITE_DATA_INDICATION
pub mod stage {
    pub const CERTIFICATE: u8 = 0x01;
    pub const PUBLIC_KEY: u8 = 0x02;
    pub const RANDOM_NUMBER: u8 = 0x03;
    pub const SIGNATURE: u8 = 0x04;
    pub const ECDH_PUBLIC_KEY: u8 = 0x05;
    pub const ECDH_SIGNATURE: u8 = 0x06;
    pub const SECRET_CONFIRM: u8 = 0x07;
}

/// Status codes exchanged over GATEWAY_STATUS and EDGE_STATUS
pub mod status {
    pub const CERTIFICATE_VERIFY_PASS: u8 = 0x01;
    pub const CERTIFICATE_VERIFY_FAIL: u8 = 0x02;
    pub const SIGNATURE_VERIFY_PASS: u8 = 0x03;
    pub const SIGNATURE_VERIFY_FAIL: u8 = 0x04;
    pub const ECDH_SIGNATURE_PASS: u8 = 0x05;
    pub const ECDH_SIGNATURE_FAIL: u8 = 0x06;
    pub const SECRET_MATCH: u8 = 0x07;
    pub const SECRET_MISMATCH: u8 = 0x08;
    pub const PUBLIC_KEY_EXTRACT_PASS: u8 = 0x09;
    pub const PUBLIC_KEY_EXTRACT_FAIL: u8 = 0x0A;
    pub const UNEXPECTED_STATE: u8 = 0x0B;
    pub const TOKEN_CRC_FAIL: u8 = 0x0C;
    pub const SHA256_CREATE_FAIL: u8 = 0x0D;
    pub const ECDH_SHA256_CREATE_FAIL: u8 = 0x0E;
    pub const ECDH_SHA256_MISMATCH: u8 = 0x0F;

    /// Written once the session key has been derived (shares the stage-7 value)
    pub const SESSION_KEY_GENERATED: u8 = SECRET_MATCH;

    /// Odd codes up to 0x09 report success
    pub fn is_success(code: u8) -> bool {
        matches!(code, 0x01 | 0x03 | 0x05 | 0x07 | 0x09)
    }

    pub fn describe(code: u8) -> &'static str {
        match code {
            CERTIFICATE_VERIFY_PASS => "gateway certificate verified",
            CERTIFICATE_VERIFY_FAIL => "gateway certificate verification failed",
            SIGNATURE_VERIFY_PASS => "signature of random number verified",
            SIGNATURE_VERIFY_FAIL => "signature of random number failed",
            ECDH_SIGNATURE_PASS => "ECDH signature verified",
            ECDH_SIGNATURE_FAIL => "ECDH signature failed",
            SECRET_MATCH => "ECDH secret matched",
            SECRET_MISMATCH => "ECDH secret did not match",
            PUBLIC_KEY_EXTRACT_PASS => "public key extracted",
            PUBLIC_KEY_EXTRACT_FAIL => "public key extraction failed",
            UNEXPECTED_STATE => "edge reported an unexpected state",
            TOKEN_CRC_FAIL => "edge rejected frame CRC",
            SHA256_CREATE_FAIL => "edge could not compute SHA-256",
            ECDH_SHA256_CREATE_FAIL => "edge could not hash the ECDH secret",
            ECDH_SHA256_MISMATCH => "ECDH secret hash mismatch on edge",
            _ => "unknown status code",
        }
    }
}
