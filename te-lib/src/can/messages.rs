//! Typed views over received J1939 messages.
//!
//! Every parser takes the raw [`Message`] plus the session's device source
//! address and returns `None` when the frame is not the expected shape; the
//! response dispatcher tries parsers in order and stays oblivious to their
//! content.

use crate::can::ca::Message;
use crate::can::name::Name;
use crate::can::pgn::{Pgn, std_pgn, te_pgn};
use crate::constants::cmd;
use crate::guide::GuideEvent;
use crate::types::{
    AuthState, HardwareId, ProjectInfo, ScreenId, VariableData, VariableId, Version,
};
use crate::update::{ComponentStatus, ComponentType, UpdateStatus, UpdateStatusType, UploadError};
use num_enum::TryFromPrimitive;
use regex::Regex;
use std::sync::OnceLock;

/// J1939 acknowledgement codes (byte 0 of an ACKNOWLEDGEMENT payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AckCode {
    Ok = 0,
    Nack = 1,
    AccessDenied = 2,
    CantRespond = 3,
}

/// ACKNOWLEDGEMENT message: code, echoed command (group function) and the
/// echoed PGN at bytes 2..5, masked to 18 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMsg {
    pub code: AckCode,
    pub group_function: u8,
    pub ack_pgn: Pgn,
}

impl AckMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != std_pgn::ACKNOWLEDGEMENT || msg.len() != 8 {
            return None;
        }
        Some(Self {
            code: AckCode::try_from(msg.data[0]).ok()?,
            group_function: msg.data[1],
            ack_pgn: Pgn::from_bytes(&msg.data[2..5])?,
        })
    }

    /// Ack whose echoed group function matches `opcode`.
    pub fn parse_for(msg: &Message, source: u8, opcode: u8) -> Option<Self> {
        Self::parse(msg, source).filter(|ack| ack.group_function == opcode)
    }
}

/// Address claim heard on the bus (any source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressClaimMsg {
    pub name: Name,
    pub sa: u8,
}

impl AddressClaimMsg {
    pub fn parse(msg: &Message) -> Option<Self> {
        if msg.pgn() != std_pgn::ADDRESS_CLAIMED {
            return None;
        }
        Some(Self {
            name: Name::from_bytes(&msg.data)?,
            sa: msg.sa(),
        })
    }
}

/// Authentication exchange frame on the AUTHENTICATION PGN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthMsg {
    pub state: AuthState,
    pub challenge: u32,
}

impl AuthMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != te_pgn::AUTHENTICATION || msg.len() < 5 {
            return None;
        }
        Some(Self {
            state: AuthState::try_from(msg.data[0]).ok()?,
            challenge: u32::from_le_bytes([msg.data[1], msg.data[2], msg.data[3], msg.data[4]]),
        })
    }
}

fn software_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"F:(?P<firmware>\d+\.\d+\.\d+)\*B:(?P<bootloader>\d+\.\d+\.\d+)\*(?:P:(?P<project>\d+\.\d+\.\d+)\*)?",
        )
        .expect("static regex")
    })
}

/// SOFTWARE_ID reply: ASCII `F:x.y.z*B:x.y.z*[P:x.y.z*]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareIdMsg {
    pub version: Version,
}

impl SoftwareIdMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != std_pgn::SOFTWARE_ID {
            return None;
        }
        let text = std::str::from_utf8(&msg.data).ok()?;
        let mut version = Version::default();
        if let Some(caps) = software_id_regex().captures(text) {
            version.firmware = caps["firmware"].to_string();
            version.bootloader = caps["bootloader"].to_string();
            if let Some(project) = caps.name("project") {
                version.project = project.as_str().to_string();
            }
        }
        Some(Self { version })
    }
}

/// Version text on the AUX PGN (`FW:…\nBL:…` form, NUL terminated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMsg {
    pub version: Version,
}

impl VersionMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != te_pgn::AUX {
            return None;
        }
        let text = std::str::from_utf8(&msg.data).ok()?.trim_end_matches('\0');
        Some(Self {
            version: Version::parse_version_str(text),
        })
    }
}

/// Command echo on the COMMAND_DATA PGN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMsg<'a> {
    pub command: u8,
    pub payload: &'a [u8],
}

impl<'a> CommandMsg<'a> {
    pub fn parse(msg: &'a Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != te_pgn::COMMAND_DATA || msg.is_empty() {
            return None;
        }
        Some(Self {
            command: msg.data[0],
            payload: &msg.data[1..],
        })
    }
}

/// GET_HARDWARE_ID reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareIdMsg {
    pub hardware_id: HardwareId,
}

impl HardwareIdMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        let command = CommandMsg::parse(msg, source)?;
        if command.command != cmd::GET_HARDWARE_ID || command.payload.len() < 4 {
            return None;
        }
        let raw = i32::from_le_bytes(command.payload[..4].try_into().ok()?);
        Some(Self {
            hardware_id: HardwareId::try_from(raw).ok()?,
        })
    }
}

/// GET_PROJECT_INFO reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectInfoMsg {
    pub project_info: ProjectInfo,
}

impl ProjectInfoMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        let command = CommandMsg::parse(msg, source)?;
        if command.command != cmd::GET_PROJECT_INFO {
            return None;
        }
        Some(Self {
            project_info: ProjectInfo::from_bytes(command.payload)?,
        })
    }
}

/// LIVE_UPDATE request acknowledgement. The raw status byte keeps its
/// transport-specific polarity (0 = accept on CAN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAckMsg {
    pub status: u8,
}

impl UpdateAckMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        let ack = AckMsg::parse(msg, source)?;
        if ack.group_function != cmd::LIVE_UPDATE {
            return None;
        }
        Some(Self {
            status: msg.data[0],
        })
    }
}

/// Status frame on the update session PGN. Byte 0 selects the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatusMsg {
    pub status_type: UpdateStatusType,
    data: Vec<u8>,
}

impl UpdateStatusMsg {
    pub fn parse(msg: &Message, source: u8, session_pgn: Pgn) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != session_pgn || msg.is_empty() {
            return None;
        }
        let status_type = UpdateStatusType::try_from(msg.data[0]).ok()?;
        let min_len = match status_type {
            UpdateStatusType::Upload => 2,
            UpdateStatusType::Update => 2,
            UpdateStatusType::Component => 7,
        };
        if msg.len() < min_len {
            return None;
        }
        Some(Self {
            status_type,
            data: msg.data.to_vec(),
        })
    }

    /// Upload error code; unrecognized values count as an unknown error.
    pub fn err(&self) -> UploadError {
        UploadError::try_from(self.data[1]).unwrap_or(UploadError::Unknown)
    }

    /// Terminal update status carried by UPDATE frames.
    pub fn update_status(&self) -> Option<UpdateStatus> {
        UpdateStatus::try_from(self.data[1] as i8).ok()
    }

    pub fn component_type(&self) -> ComponentType {
        if self.status_type != UpdateStatusType::Component {
            return ComponentType::Unknown;
        }
        ComponentType::try_from(self.data[1] as i8).unwrap_or(ComponentType::Unknown)
    }

    pub fn component_status(&self) -> Option<ComponentStatus> {
        if self.status_type != UpdateStatusType::Component {
            return None;
        }
        ComponentStatus::try_from(self.data[2]).ok()
    }

    pub fn component_progress(&self) -> u32 {
        if self.status_type != UpdateStatusType::Component || self.data.len() < 7 {
            return 0;
        }
        u32::from_le_bytes([self.data[3], self.data[4], self.data[5], self.data[6]])
    }
}

/// Solicited GUIDE response on the configured response PGN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideResponseMsg {
    pub command: u8,
    pub screen_id: ScreenId,
    pub variable_id: Option<VariableId>,
    pub value: Option<VariableData>,
}

impl GuideResponseMsg {
    /// `screen`/`variable` narrow the match to an echoed identifier pair.
    pub fn parse(
        msg: &Message,
        source: u8,
        response_pgn: Pgn,
        command: u8,
        screen: Option<ScreenId>,
        variable: Option<VariableId>,
    ) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != response_pgn || msg.len() < 2 {
            return None;
        }
        if msg.data[0] != command {
            return None;
        }
        let screen_id = ScreenId::new(msg.data[1]);
        if let Some(expected) = screen {
            if screen_id != expected {
                return None;
            }
        }
        let variable_id = (msg.len() > 2).then(|| VariableId::new(msg.data[2]));
        if let Some(expected) = variable {
            if variable_id != Some(expected) {
                return None;
            }
        }
        let value = (msg.len() > 3).then(|| VariableData::from_bytes(msg.data[3..].to_vec()));
        Some(Self {
            command,
            screen_id,
            variable_id,
            value,
        })
    }
}

/// Knob calibration frame, in either the raw or the calibrated form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationMsg {
    pub raw_form: bool,
    pub position: u8,
    pub raw_angle: u16,
}

impl CalibrationMsg {
    pub fn parse(msg: &Message, source: u8) -> Option<Self> {
        if msg.sa() != source || msg.pgn() != te_pgn::CALIBRATION || msg.len() < 5 {
            return None;
        }
        let d = &msg.data;
        if d[2] == 0xFF && d[3] == 0xFF {
            Some(Self {
                raw_form: true,
                position: d[4],
                raw_angle: u16::from_le_bytes([d[0], d[1]]),
            })
        } else {
            Some(Self {
                raw_form: false,
                position: d[0],
                raw_angle: u16::from_le_bytes([d[1], d[2]]),
            })
        }
    }

    /// Knob angle in degrees, rounded to two decimal places.
    pub fn angle(&self) -> f64 {
        (self.raw_angle as f64 * 360.0 / 65536.0 * 100.0).round() / 100.0
    }
}

/// Parse an unsolicited GUIDE notification from a GUIDE-PGN message.
pub fn guide_event(msg: &Message, source: u8) -> Option<GuideEvent> {
    if msg.sa() != source || msg.pgn() != te_pgn::GUIDE {
        return None;
    }
    GuideEvent::parse_payload(&msg.data)
}
