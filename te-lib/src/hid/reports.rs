//! Typed views over raw HID reports. Same contract as the CAN message
//! parsers: `None` means "not this report", and the response dispatcher
//! tries parsers in order.

use crate::constants::{cmd, context, report_id};
use crate::error::{Result, TeError};
use crate::types::{AuthState, HardwareId, ProjectInfo, ScreenId, VariableData, VariableId};
use crate::update::{ComponentStatus, ComponentType, UpdateStatus, UpdateStatusType, UploadError};
use bytes::Bytes;
use num_enum::TryFromPrimitive;
use tokio::time::Instant;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Report ID of the GUIDE error notification.
pub const GUIDE_ERROR_REPORT: u8 = 0x20;

/// Largest payload a short context-sensitive report can carry.
pub const CS_SHORT_MAX: usize = 61;
/// Largest payload a long context-sensitive report can carry.
pub const CS_LONG_MAX: usize = 1020;

/// A raw report delivered by the background receiver, stamped at enqueue
/// time with the monotonic clock.
#[derive(Debug, Clone)]
pub struct ReportFrame {
    pub raw: Bytes,
    pub timestamp: Instant,
}

impl ReportFrame {
    pub fn new(raw: impl Into<Bytes>, timestamp: Instant) -> Self {
        Self {
            raw: raw.into(),
            timestamp,
        }
    }

    pub fn report_id(&self) -> u8 {
        self.raw.first().copied().unwrap_or(0)
    }
}

/// Variable-length payload addressed by a 1-byte context ID. Two physical
/// forms, selected by payload size:
/// short `[0x04][ctx][len:1][data]`, long `[0x03][ctx][len:2 LE][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSensitiveReport {
    pub context_id: u8,
    pub data: Bytes,
}

impl ContextSensitiveReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let raw = &frame.raw;
        match *raw.first()? {
            report_id::CS_DATA_SHORT => {
                let size = *raw.get(2)? as usize;
                raw.get(3..3 + size)?;
                Some(Self {
                    context_id: raw[1],
                    data: raw.slice(3..3 + size),
                })
            }
            report_id::CS_DATA_LONG => {
                let size = u16::from_le_bytes(raw.get(2..4)?.try_into().ok()?) as usize;
                raw.get(4..4 + size)?;
                Some(Self {
                    context_id: raw[1],
                    data: raw.slice(4..4 + size),
                })
            }
            _ => None,
        }
    }

    /// Build the wire form for a payload, choosing short or long framing by
    /// size. Payloads over [`CS_LONG_MAX`] bytes do not fit either form.
    pub fn encode(context_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() <= CS_SHORT_MAX {
            let mut report = Vec::with_capacity(3 + payload.len());
            report.push(report_id::CS_DATA_SHORT);
            report.push(context_id);
            report.push(payload.len() as u8);
            report.extend_from_slice(payload);
            Ok(report)
        } else if payload.len() <= CS_LONG_MAX {
            let mut report = Vec::with_capacity(4 + payload.len());
            report.push(report_id::CS_DATA_LONG);
            report.push(context_id);
            report.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            report.extend_from_slice(payload);
            Ok(report)
        } else {
            Err(TeError::PayloadTooLarge(payload.len()))
        }
    }
}

/// Signed ack codes carried by `COMMAND_ACK` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i8)]
pub enum HidAckCode {
    AccDenied = -2,
    Err = -1,
    Unknown = 0,
    Ok = 1,
}

/// 11-byte `COMMAND_ACK` report: `[5][command][code:1 signed][data…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    pub command: u8,
    pub code: HidAckCode,
    pub data: Bytes,
}

impl AckReport {
    pub const LENGTH: usize = 11;

    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let raw = &frame.raw;
        if frame.report_id() != report_id::COMMAND_ACK || raw.len() < Self::LENGTH {
            return None;
        }
        Some(Self {
            command: raw[1],
            code: HidAckCode::try_from(raw[2] as i8).ok()?,
            data: raw.slice(3..),
        })
    }

    /// Ack echoing a specific command opcode.
    pub fn parse_for(frame: &ReportFrame, opcode: u8) -> Option<Self> {
        Self::parse(frame).filter(|ack| ack.command == opcode)
    }
}

/// `GET_HARDWARE_ID` ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareIdReport {
    pub code: HidAckCode,
    pub hardware_id: HardwareId,
}

impl HardwareIdReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let ack = AckReport::parse_for(frame, cmd::GET_HARDWARE_ID)?;
        let raw = i32::from_le_bytes(ack.data.get(..4)?.try_into().ok()?);
        Some(Self {
            code: ack.code,
            hardware_id: HardwareId::try_from(raw).ok()?,
        })
    }
}

/// `GET_PROJECT_INFO` ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectInfoReport {
    pub code: HidAckCode,
    pub project_info: ProjectInfo,
}

impl ProjectInfoReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let ack = AckReport::parse_for(frame, cmd::GET_PROJECT_INFO)?;
        Some(Self {
            code: ack.code,
            project_info: ProjectInfo::from_bytes(&ack.data)?,
        })
    }
}

/// Authentication exchange frame: a context-sensitive report on the AUTH
/// context carrying `[state][challenge:4 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthReport {
    pub state: AuthState,
    pub challenge: u32,
}

impl AuthReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let cs = ContextSensitiveReport::parse(frame)?;
        if cs.context_id != context::AUTH || cs.data.len() < 5 {
            return None;
        }
        Some(Self {
            state: AuthState::try_from(cs.data[0]).ok()?,
            challenge: u32::from_le_bytes(cs.data[1..5].try_into().ok()?),
        })
    }
}

/// `LIVE_UPDATE` request acknowledgement. The raw status byte keeps its
/// transport-specific polarity (1 = accept on HID).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAckReport {
    pub status: u8,
}

impl UpdateAckReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let raw = &frame.raw;
        if frame.report_id() != report_id::COMMAND_ACK
            || raw.len() < AckReport::LENGTH
            || raw[1] != cmd::LIVE_UPDATE
        {
            return None;
        }
        Some(Self { status: raw[2] })
    }
}

/// `UPDATE_STATUS` report. Byte 1 selects the layout; the remaining fields
/// sit one byte later than in the CAN form because of the report ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatusReport {
    pub status_type: UpdateStatusType,
    data: Bytes,
}

impl UpdateStatusReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let raw = &frame.raw;
        if frame.report_id() != report_id::UPDATE_STATUS || raw.len() < 2 {
            return None;
        }
        let status_type = UpdateStatusType::try_from(raw[1]).ok()?;
        let min_len = match status_type {
            UpdateStatusType::Upload => 3,
            UpdateStatusType::Update => 3,
            UpdateStatusType::Component => 8,
        };
        if raw.len() < min_len {
            return None;
        }
        Some(Self {
            status_type,
            data: raw.clone(),
        })
    }

    /// Upload error code; unrecognized values count as an unknown error.
    pub fn err(&self) -> UploadError {
        UploadError::try_from(self.data[2]).unwrap_or(UploadError::Unknown)
    }

    /// Terminal update status carried by UPDATE frames.
    pub fn update_status(&self) -> Option<UpdateStatus> {
        UpdateStatus::try_from(self.data[2] as i8).ok()
    }

    pub fn component_type(&self) -> ComponentType {
        if self.status_type != UpdateStatusType::Component {
            return ComponentType::Unknown;
        }
        ComponentType::try_from(self.data[2] as i8).unwrap_or(ComponentType::Unknown)
    }

    pub fn component_status(&self) -> Option<ComponentStatus> {
        if self.status_type != UpdateStatusType::Component {
            return None;
        }
        ComponentStatus::try_from(self.data[3]).ok()
    }

    pub fn component_progress(&self) -> u32 {
        if self.status_type != UpdateStatusType::Component || self.data.len() < 8 {
            return 0;
        }
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }
}

/// Screen report on the widget channel: `[SCREEN][screen_id]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenReport {
    pub screen_id: ScreenId,
}

impl ScreenReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        Self::parse_raw(&frame.raw)
    }

    pub fn parse_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 || raw[0] != crate::guide::guide_cmd::SCREEN {
            return None;
        }
        Some(Self {
            screen_id: ScreenId::new(raw[1]),
        })
    }
}

/// Variable report: `[VARIABLE][screen][var][size:2 LE][value…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableReport {
    pub screen_id: ScreenId,
    pub variable_id: VariableId,
    pub value: VariableData,
}

impl VariableReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        Self::parse_raw(&frame.raw)
    }

    pub fn parse_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() < 5 || raw[0] != crate::guide::guide_cmd::VARIABLE {
            return None;
        }
        let size = u16::from_le_bytes([raw[3], raw[4]]) as usize;
        let value = &raw[5..];
        let value = if size <= value.len() { &value[..size] } else { value };
        Some(Self {
            screen_id: ScreenId::new(raw[1]),
            variable_id: VariableId::new(raw[2]),
            value: VariableData::from_bytes(value.to_vec()),
        })
    }
}

/// GUIDE error notification naming the report the device refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuideErrorReport {
    pub failed_report_id: u8,
}

impl GuideErrorReport {
    pub fn parse(frame: &ReportFrame) -> Option<Self> {
        let raw = &frame.raw;
        if frame.report_id() != GUIDE_ERROR_REPORT || raw.len() < 2 {
            return None;
        }
        Some(Self {
            failed_report_id: raw[1],
        })
    }
}

/// 7-byte version feature report: `[report_id][major:2][minor:2][patch:2]`,
/// all little-endian.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VersionFeatureReport {
    pub report_id: u8,
    pub major: U16,
    pub minor: U16,
    pub patch: U16,
}

impl VersionFeatureReport {
    /// Decode a feature-report buffer into a `major.minor.patch` string.
    pub fn version_string(raw: &[u8]) -> Option<String> {
        let report = VersionFeatureReport::read_from_bytes(raw.get(..7)?).ok()?;
        Some(format!(
            "{}.{}.{}",
            report.major.get(),
            report.minor.get(),
            report.patch.get()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(raw: &[u8]) -> ReportFrame {
        ReportFrame::new(raw.to_vec(), Instant::now())
    }

    #[test]
    fn cs_report_short_long_selection() {
        let short = ContextSensitiveReport::encode(context::AUTH, &[0u8; 61]).unwrap();
        assert_eq!(short[0], report_id::CS_DATA_SHORT);
        assert_eq!(short[2], 61);

        let long = ContextSensitiveReport::encode(context::AUTH, &[0u8; 62]).unwrap();
        assert_eq!(long[0], report_id::CS_DATA_LONG);
        assert_eq!(&long[2..4], &62u16.to_le_bytes());

        let long_max = ContextSensitiveReport::encode(context::AUTH, &[0u8; 1020]).unwrap();
        assert_eq!(long_max[0], report_id::CS_DATA_LONG);

        assert!(matches!(
            ContextSensitiveReport::encode(context::AUTH, &[0u8; 1021]),
            Err(TeError::PayloadTooLarge(1021))
        ));
    }

    #[test]
    fn cs_report_round_trip() {
        for len in [0usize, 1, 61, 62, 1020] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let raw = ContextSensitiveReport::encode(0x7, &payload).unwrap();
            let parsed = ContextSensitiveReport::parse(&frame(&raw)).unwrap();
            assert_eq!(parsed.context_id, 0x7);
            assert_eq!(&parsed.data[..], &payload[..]);
        }
    }

    #[test]
    fn ack_report_signed_codes() {
        let mut raw = vec![report_id::COMMAND_ACK, cmd::BRIGHTNESS, 0x01];
        raw.resize(AckReport::LENGTH, 0);
        let ack = AckReport::parse(&frame(&raw)).unwrap();
        assert_eq!(ack.code, HidAckCode::Ok);
        assert_eq!(ack.command, cmd::BRIGHTNESS);

        raw[2] = (-2i8) as u8;
        let ack = AckReport::parse(&frame(&raw)).unwrap();
        assert_eq!(ack.code, HidAckCode::AccDenied);

        // Too short, wrong report ID.
        assert!(AckReport::parse(&frame(&raw[..5])).is_none());
        raw[0] = report_id::UPDATE_STATUS;
        assert!(AckReport::parse(&frame(&raw)).is_none());
    }

    #[test]
    fn auth_report_from_short_cs() {
        // [0x04][ctx][len][state][challenge LE]
        let raw = [
            report_id::CS_DATA_SHORT,
            context::AUTH,
            5,
            0x00,
            0x44,
            0x33,
            0x22,
            0x11,
        ];
        let auth = AuthReport::parse(&frame(&raw)).unwrap();
        assert_eq!(auth.state, AuthState::Challenge);
        assert_eq!(auth.challenge, 0x1122_3344);
    }

    #[test]
    fn update_status_component_fields() {
        let raw = [
            report_id::UPDATE_STATUS,
            UpdateStatusType::Component as u8,
            ComponentType::Firmware as i8 as u8,
            0x30, // PROGRESS
            42,
            0,
            0,
            0,
        ];
        let status = UpdateStatusReport::parse(&frame(&raw)).unwrap();
        assert_eq!(status.status_type, UpdateStatusType::Component);
        assert_eq!(status.component_type(), ComponentType::Firmware);
        assert_eq!(status.component_status(), Some(ComponentStatus::Progress));
        assert_eq!(status.component_progress(), 42);
    }

    #[test]
    fn version_feature_report_decodes() {
        let raw = [report_id::FW_VER, 2, 0, 11, 0, 3, 1];
        assert_eq!(
            VersionFeatureReport::version_string(&raw).as_deref(),
            Some("2.11.259")
        );
        assert_eq!(VersionFeatureReport::version_string(&raw[..5]), None);
    }

    #[test]
    fn variable_report_trims_to_size() {
        let raw = [0x02, 3, 5, 4, 0, 0x2A, 0, 0, 0, 0xEE, 0xEE];
        let report = VariableReport::parse(&frame(&raw)).unwrap();
        assert_eq!(report.screen_id, ScreenId::new(3));
        assert_eq!(report.variable_id, VariableId::new(5));
        assert_eq!(report.value.to_int(), Some(42));
    }
}
