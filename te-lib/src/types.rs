//! Device-independent data types: operation statuses, identifiers,
//! version/hardware/project metadata and the variable value codec.

use crate::error::TeError;
use num_enum::TryFromPrimitive;
use std::fmt;
use strum_macros::Display;

/// Outcome of a command-style operation.
///
/// Transport faults are logged and collapsed into [`Status::Error`];
/// everything else is a protocol-level verdict from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    #[strum(serialize = "Success")]
    Success,
    #[strum(serialize = "NACK")]
    Nack,
    #[strum(serialize = "Access Denied")]
    AccessDenied,
    #[strum(serialize = "Auth Required")]
    AuthRequired,
    #[strum(serialize = "Auth Request Failed")]
    AuthRequestFailed,
    #[strum(serialize = "Auth Challenge Failed")]
    AuthChallengeFailed,
    #[strum(serialize = "Restart Timed Out")]
    RestartTimeout,
    #[strum(serialize = "Error")]
    Error,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Hardware identity reported by `GET_HARDWARE_ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, Display)]
#[repr(i32)]
pub enum HardwareId {
    Bad = -1,
    /// Touch Encoder Refresh, USB
    TeRfUsb = 0x00,
    /// Touch Encoder Refresh, CAN
    TeRfCan = 0x01,
    /// Touch Encoder Flush Mount, USB
    TeFxUsb = 0x10,
    /// Touch Encoder Flush Mount, CAN
    TeFxCan = 0x11,
    /// Touch Encoder Mix (USB + CAN)
    TeMx = 0x100,
}

/// Kind of project loaded on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, Display, Default)]
#[repr(i8)]
pub enum ProjectType {
    #[default]
    Unknown = -1,
    Guide = 0,
    Giib = 1,
}

/// Project metadata: type byte followed by a little-endian CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectInfo {
    pub project_type: ProjectType,
    pub checksum: u32,
}

impl ProjectInfo {
    /// Wire form: `[type:1][checksum:4 LE]`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 {
            return None;
        }
        let project_type = ProjectType::try_from(bytes[0] as i8).ok()?;
        let checksum = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(Self { project_type, checksum })
    }

    pub fn to_bytes(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = self.project_type as i8 as u8;
        out[1..5].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }
}

impl fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.project_type, self.checksum)
    }
}

pub const VERSION_NOT_FOUND: &str = "Not Found";

/// Firmware/bootloader/project/custom-module version strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub firmware: String,
    pub bootloader: String,
    pub project: String,
    pub custom_module: String,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            firmware: VERSION_NOT_FOUND.to_string(),
            bootloader: VERSION_NOT_FOUND.to_string(),
            project: VERSION_NOT_FOUND.to_string(),
            custom_module: VERSION_NOT_FOUND.to_string(),
        }
    }
}

impl Version {
    /// Parse the textual form sent on the AUX channel:
    /// newline-separated `FW:x.y.z`, `BL:x.y.z`, `PJ:x.y.z`, `CM:x.y.z`.
    pub fn parse_version_str(text: &str) -> Self {
        let mut version = Version::default();
        for line in text.lines() {
            let Some((tag, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match tag.trim() {
                "FW" => version.firmware = value,
                "BL" => version.bootloader = value,
                "PJ" => version.project = value,
                "CM" => version.custom_module = value,
                _ => {}
            }
        }
        version
    }
}

/// Non-negative GUIDE screen identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScreenId(u8);

impl ScreenId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for ScreenId {
    type Error = TeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map(Self)
            .map_err(|_| TeError::Protocol(format!("invalid screen ID {value}")))
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Non-negative GUIDE variable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(u8);

impl VariableId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for VariableId {
    type Error = TeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map(Self)
            .map_err(|_| TeError::Protocol(format!("invalid variable ID {value}")))
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Encoded value of a GUIDE variable.
///
/// Integers encode as 4 bytes little-endian signed, strings as UTF-8 plus a
/// single NUL terminator, raw bytes pass through unchanged. Decoding is
/// caller-directed via [`VariableData::to_int`] / [`VariableData::to_string`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableData {
    data: Vec<u8>,
}

impl VariableData {
    pub fn from_int(value: i32) -> Self {
        Self {
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn from_str(value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self { data }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Interpret as a little-endian signed integer of up to 4 bytes.
    pub fn to_int(&self) -> Option<i32> {
        if self.data.len() > 4 {
            return None;
        }
        let mut buf = [0u8; 4];
        buf[..self.data.len()].copy_from_slice(&self.data);
        let mut value = i32::from_le_bytes(buf);
        // Sign-extend short encodings.
        if self.data.len() < 4 {
            let bits = self.data.len() as u32 * 8;
            if bits > 0 {
                value = (value << (32 - bits)) >> (32 - bits);
            }
        }
        Some(value)
    }

    /// Interpret as UTF-8 text, stripping one trailing NUL if present.
    pub fn to_string(&self) -> Option<String> {
        let mut text = String::from_utf8(self.data.clone()).ok()?;
        if text.ends_with('\0') {
            text.pop();
        }
        Some(text)
    }
}

/// Authentication clearance levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Clearance {
    ServiceTool = 1,
    Invalid = 255,
}

/// Authentication exchange state, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AuthState {
    Challenge = 0,
    Response = 1,
    Complete = 255,
}

/// Service-tool challenge/response transform.
pub fn service_tool_secret(secret: u32, magic: u32) -> u32 {
    magic
        ^ (secret
            .wrapping_add(0x63F0_7B35)
            .wrapping_add(magic << 6)
            .wrapping_add(magic >> 2))
}

/// Challenge response for a clearance level. Only the service tool has an
/// effective secret; other clearances echo the challenge back.
pub fn auth_response(clearance: Clearance, secret: u32, magic: u32) -> u32 {
    match clearance {
        Clearance::ServiceTool => service_tool_secret(secret, magic),
        _ => magic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_data_int_round_trip() {
        for value in [0i32, 1, -1, 42, i32::MIN, i32::MAX] {
            let data = VariableData::from_int(value);
            assert_eq!(data.as_bytes().len(), 4);
            assert_eq!(data.to_int(), Some(value));
        }
    }

    #[test]
    fn variable_data_rejects_wide_int() {
        let data = VariableData::from_bytes(vec![0u8; 5]);
        assert_eq!(data.to_int(), None);
    }

    #[test]
    fn variable_data_string_round_trip() {
        let data = VariableData::from_str("backlight");
        assert_eq!(data.as_bytes().last(), Some(&0));
        assert_eq!(data.to_string().as_deref(), Some("backlight"));
    }

    #[test]
    fn variable_data_string_without_nul() {
        let data = VariableData::from_bytes(b"raw".to_vec());
        assert_eq!(data.to_string().as_deref(), Some("raw"));
    }

    #[test]
    fn project_info_round_trip() {
        let info = ProjectInfo {
            project_type: ProjectType::Guide,
            checksum: 0xDEAD_BEEF,
        };
        assert_eq!(ProjectInfo::from_bytes(&info.to_bytes()), Some(info));
    }

    #[test]
    fn project_info_rejects_short_buffer() {
        assert_eq!(ProjectInfo::from_bytes(&[0x00, 0x01]), None);
    }

    #[test]
    fn version_text_parse() {
        let version = Version::parse_version_str("FW:1.2.3\nBL:0.9.1\nPJ:4.5.6\nCM:0.0.1");
        assert_eq!(version.firmware, "1.2.3");
        assert_eq!(version.bootloader, "0.9.1");
        assert_eq!(version.project, "4.5.6");
        assert_eq!(version.custom_module, "0.0.1");
    }

    #[test]
    fn service_tool_vector() {
        // Known-answer check of the challenge transform.
        let magic = 0x1122_3344u32;
        let expected = magic
            ^ (0x1337u32
                .wrapping_add(0x63F0_7B35)
                .wrapping_add(magic << 6)
                .wrapping_add(magic >> 2));
        assert_eq!(auth_response(Clearance::ServiceTool, 0x1337, magic), expected);
        // Non service-tool clearances return the challenge unchanged.
        assert_eq!(auth_response(Clearance::Invalid, 0x1337, magic), magic);
    }
}
