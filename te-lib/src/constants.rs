//! Protocol constants shared by both transports.

use std::time::Duration;

/// Command opcodes understood by every Touch Encoder, sent as the first byte
/// of the 8-byte command payload.
pub mod cmd {
    pub const ST_AUTH: u8 = 0x01;
    pub const RIE: u8 = 0x08;
    pub const RESTART: u8 = 0x44;
    pub const RESTART_UTILITY_APP: u8 = 0x45;
    pub const LIVE_UPDATE: u8 = 0x55;
    pub const BRIGHTNESS: u8 = 0x80;
    pub const SUSPEND: u8 = 0xF0;
    pub const GET_VERSION_EXT: u8 = 0xC1;
    pub const GET_HARDWARE_ID: u8 = 0xC2;
    pub const GET_PROJECT_INFO: u8 = 0xC3;
    pub const CONFIGURE_NAME: u8 = 0xE1;
}

/// HID report IDs (first byte of every report).
pub mod report_id {
    pub const GIIBRPT: u8 = 3;
    pub const CS_DATA_LONG: u8 = 3;
    pub const CS_DATA_SHORT: u8 = 4;
    pub const COMMAND_ACK: u8 = 5;
    pub const UPDATE_DATA: u8 = 8;
    pub const UPDATE_STATUS: u8 = 9;
    pub const BL_VER: u8 = 16;
    pub const FW_VER: u8 = 17;
    pub const PROJ_VER: u8 = 18;
    pub const CMOD_VER: u8 = 19;
}

/// Context IDs for the context-sensitive HID data framing.
pub mod context {
    pub const AUTH: u8 = 0x01;
}

/// Number of bytes in a command payload (opcode + 7 parameter bytes).
pub const COMMAND_LEN: usize = 8;

/// Maximum HID report size, including the report ID byte.
pub const MAX_REPORT_SIZE: usize = 1024;

/// Maximum firmware upload chunk over HID: report minus the
/// `[UPDATE_DATA][len:2 LE]` header.
pub const MAX_UPLOAD_CHUNK: usize = MAX_REPORT_SIZE - 3;

/// Maximum J1939 transport-protocol payload, which is also the CAN-side
/// firmware upload chunk size.
pub const J1939_MTU: usize = 1785;

/// Default window for a single command/response exchange.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a device is given to come back after a restart.
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound on a whole firmware-update call.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(12 * 60);

/// Per-phase deadline used after upload EOF and between component
/// status frames during an update.
pub const UPDATE_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default window for collecting address claims during a bus scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(2);
