//! GUIDE protocol vocabulary shared by both transports: sub-command codes,
//! notification report IDs, the input-event taxonomy and the parsed
//! notification type.

use crate::types::{ScreenId, VariableId};
use num_enum::TryFromPrimitive;

/// GUIDE sub-commands (second byte of a GUIDE command, or the widget-channel
/// report ID on HID).
pub mod guide_cmd {
    pub const SCREEN: u8 = 0x01;
    pub const VARIABLE: u8 = 0x02;
    pub const INT_VARIABLE: u8 = 0x03;
    pub const STRING_VARIABLE: u8 = 0x04;
}

/// Unsolicited notification report IDs emitted by the device.
pub mod notification {
    pub const INT_VAR: u8 = 3;
    pub const STRING_VAR: u8 = 4;
    pub const KNOB_EVENT: u8 = 16;
    pub const TOUCH_EVENT: u8 = 17;
    pub const GESTURE_EVENT: u8 = 18;
    pub const SCENE_EVENT: u8 = 19;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TouchType {
    Down = 0,
    Move = 1,
    Up = 2,
    Enter = 3,
    Leave = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum GestureType {
    Tap = 0,
    AxisSwipe = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum GestureDirection {
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
    Unknown = 4,
}

/// Unsolicited GUIDE notification. The payload layout is shared by both
/// transports: on HID it is a widget report, on CAN a GUIDE-PGN message
/// whose data starts with the same notification ID byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuideEvent {
    IntVar {
        screen_id: ScreenId,
        variable_id: VariableId,
        value: i32,
    },
    StringVar {
        screen_id: ScreenId,
        variable_id: VariableId,
        value: String,
    },
    Knob {
        element_id: u8,
        delta: i16,
    },
    Touch {
        element_id: u8,
        touch_type: TouchType,
        x: i16,
        y: i16,
    },
    Gesture {
        element_id: u8,
        gesture_type: GestureType,
        x: i16,
        y: i16,
        direction: GestureDirection,
    },
}

impl GuideEvent {
    /// Parse a notification payload whose first byte is the report ID.
    pub fn parse_payload(d: &[u8]) -> Option<Self> {
        if d.is_empty() {
            return None;
        }
        match d[0] {
            id if id == notification::INT_VAR && d.len() >= 7 => Some(GuideEvent::IntVar {
                screen_id: ScreenId::new(d[1]),
                variable_id: VariableId::new(d[2]),
                value: i32::from_le_bytes([d[3], d[4], d[5], d[6]]),
            }),
            id if id == notification::STRING_VAR && d.len() >= 3 => Some(GuideEvent::StringVar {
                screen_id: ScreenId::new(d[1]),
                variable_id: VariableId::new(d[2]),
                value: String::from_utf8(d[3..].to_vec()).ok()?,
            }),
            id if id == notification::KNOB_EVENT && d.len() >= 5 => Some(GuideEvent::Knob {
                element_id: d[1],
                delta: i16::from_le_bytes([d[3], d[4]]),
            }),
            id if id == notification::TOUCH_EVENT && d.len() >= 8 => Some(GuideEvent::Touch {
                element_id: d[1],
                touch_type: TouchType::try_from(d[2]).ok()?,
                x: i16::from_le_bytes([d[4], d[5]]),
                y: i16::from_le_bytes([d[6], d[7]]),
            }),
            id if id == notification::GESTURE_EVENT && d.len() >= 5 => {
                let gesture_type = GestureType::try_from(d[2]).ok()?;
                match gesture_type {
                    GestureType::Tap if d.len() >= 8 => Some(GuideEvent::Gesture {
                        element_id: d[1],
                        gesture_type,
                        x: i16::from_le_bytes([d[4], d[5]]),
                        y: i16::from_le_bytes([d[6], d[7]]),
                        direction: GestureDirection::Unknown,
                    }),
                    GestureType::AxisSwipe => Some(GuideEvent::Gesture {
                        element_id: d[1],
                        gesture_type,
                        x: 0,
                        y: 0,
                        direction: GestureDirection::try_from(d[4]).ok()?,
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
