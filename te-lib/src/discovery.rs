//! Transport discovery: enumerate USB Touch Encoders, scan every CAN bus in
//! parallel, and hand back ready sessions.

use crate::can::J1939TouchEncoder;
use crate::can::ca::{Ca, ControllerApp};
use crate::can::kernel::KernelCa;
use crate::can::universal::UniversalCa;
use crate::constants::SCAN_TIMEOUT;
use crate::error::Result;
use crate::hid::HidTouchEncoder;
use crate::hid::transport::{PRODUCT_ID, VENDOR_ID};
use crate::types::Status;
use crate::update::{UpdateState, UpdateStatus};
use std::path::Path;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Host addresses per bus: the scanner claims `K*5 + 1` on `…canK`, each
/// discovered device session the next address up.
pub const MAX_TE_PER_BUS: usize = 5;

/// A discovered Touch Encoder, whichever transport it arrived on. The set
/// of transports is closed; new ones are a protocol change.
pub enum TouchEncoder {
    Hid(HidTouchEncoder),
    Can(J1939TouchEncoder),
}

impl TouchEncoder {
    pub fn interface_id(&self) -> String {
        match self {
            TouchEncoder::Hid(te) => te.interface_id(),
            TouchEncoder::Can(te) => te.interface_id(),
        }
    }

    pub async fn in_utility_app(&mut self) -> bool {
        match self {
            TouchEncoder::Hid(te) => te.in_utility_app(),
            TouchEncoder::Can(te) => te.in_utility_app().await,
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            TouchEncoder::Hid(te) => te.disconnect().await,
            TouchEncoder::Can(te) => te.disconnect().await,
        }
    }

    pub async fn authenticate(&mut self, clearance: crate::types::Clearance) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.authenticate(clearance).await,
            TouchEncoder::Can(te) => te.authenticate(clearance).await,
        }
    }

    pub async fn refresh_info(&mut self) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.refresh_info().await,
            TouchEncoder::Can(te) => te.refresh_info().await,
        }
    }

    pub async fn set_brightness(&mut self, level: u8, store: bool) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.set_brightness(level, store).await,
            TouchEncoder::Can(te) => te.set_brightness(level, store).await,
        }
    }

    pub async fn restart(&mut self, to_utility: bool, wait: bool, authenticate: bool) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.restart(to_utility, wait, authenticate).await,
            TouchEncoder::Can(te) => te.restart(to_utility, wait, authenticate).await,
        }
    }

    pub async fn update<F>(&mut self, filepath: &Path, progress: &mut F) -> Result<UpdateStatus>
    where
        F: FnMut(UpdateState, Option<u64>, Option<u64>),
    {
        match self {
            TouchEncoder::Hid(te) => te.update(filepath, progress).await,
            TouchEncoder::Can(te) => te.update(filepath, progress).await,
        }
    }

    pub async fn get_screen(&mut self) -> Result<crate::types::ScreenId> {
        match self {
            TouchEncoder::Hid(te) => te.get_screen().await,
            TouchEncoder::Can(te) => te.get_screen().await,
        }
    }

    pub async fn set_screen(&mut self, screen: crate::types::ScreenId) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.set_screen(screen).await,
            TouchEncoder::Can(te) => te.set_screen(screen).await,
        }
    }

    pub async fn get_var(
        &mut self,
        screen: crate::types::ScreenId,
        variable: crate::types::VariableId,
    ) -> Result<crate::types::VariableData> {
        match self {
            TouchEncoder::Hid(te) => te.get_var(screen, variable).await,
            TouchEncoder::Can(te) => te.get_var(screen, variable).await,
        }
    }

    pub async fn set_var(
        &mut self,
        screen: crate::types::ScreenId,
        variable: crate::types::VariableId,
        data: &crate::types::VariableData,
    ) -> Status {
        match self {
            TouchEncoder::Hid(te) => te.set_var(screen, variable, data).await,
            TouchEncoder::Can(te) => te.set_var(screen, variable, data).await,
        }
    }

    pub fn version(&self) -> &crate::types::Version {
        match self {
            TouchEncoder::Hid(te) => &te.version,
            TouchEncoder::Can(te) => &te.version,
        }
    }

    pub fn hardware_id(&self) -> Option<crate::types::HardwareId> {
        match self {
            TouchEncoder::Hid(te) => te.hardware_id,
            TouchEncoder::Can(te) => te.hardware_id,
        }
    }

    pub fn project_info(&self) -> crate::types::ProjectInfo {
        match self {
            TouchEncoder::Hid(te) => te.project_info,
            TouchEncoder::Can(te) => te.project_info,
        }
    }
}

/// Enumerate USB Touch Encoders, one session per serial number. Devices
/// that fail to open (busy, permissions) are logged and skipped.
pub async fn discover_hid() -> Result<Vec<TouchEncoder>> {
    let mut sessions = Vec::new();
    let devices = nusb::list_devices().await?;
    for info in devices.filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID) {
        let serial = info.serial_number().unwrap_or_default();
        if serial.is_empty() {
            debug!("skipping Touch Encoder without a serial number");
            continue;
        }
        match HidTouchEncoder::open_from(&info).await {
            Ok(te) => sessions.push(TouchEncoder::Hid(te)),
            Err(e) => warn!("could not initialize usb:{serial}: {e}"),
        }
    }
    Ok(sessions)
}

/// Names of CAN network interfaces on this host.
pub fn can_interfaces() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.contains("can"))
        .collect();
    names.sort();
    names
}

/// Scanner base address for an interface named `…canK`.
fn base_address(interface: &str) -> u8 {
    let digits: String = interface
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let index: u8 = digits.parse().unwrap_or(0);
    index.wrapping_mul(MAX_TE_PER_BUS as u8).wrapping_add(1)
}

/// Open a CA on `interface`, preferring the kernel J1939 stack and falling
/// back to the raw-CAN backend when the socket family is unavailable.
pub async fn open_ca(interface: &str, address: u8) -> Result<Ca> {
    match KernelCa::new(interface, address) {
        Ok(ca) => Ok(Ca::Kernel(ca)),
        Err(e) => {
            debug!("{interface}: kernel J1939 unavailable ({e}); using raw CAN");
            Ok(Ca::Universal(UniversalCa::new(interface, address).await?))
        }
    }
}

/// Scan one bus: claim the scanner address, collect address claims, then
/// open one session (with its own CA) per discovered device.
pub async fn scan_bus(interface: &str) -> Result<Vec<TouchEncoder>> {
    let base = base_address(interface);
    let mut scanner = open_ca(interface, base).await?;
    let claims = scanner.scan_for_devices(SCAN_TIMEOUT).await;
    scanner.disconnect().await;
    let claims = claims?;

    let mut sessions = Vec::new();
    for (offset, claim) in claims.iter().take(MAX_TE_PER_BUS).enumerate() {
        let host_address = base.wrapping_add(offset as u8 + 1);
        match open_ca(interface, host_address).await {
            Ok(ca) => {
                info!(
                    "{interface}: Touch Encoder at {:#04x} ({})",
                    claim.source_address, claim.name
                );
                sessions.push(TouchEncoder::Can(J1939TouchEncoder::new(
                    ca,
                    claim.source_address,
                    claim.name,
                )));
            }
            Err(e) => warn!("{interface}: could not open CA at {host_address:#04x}: {e}"),
        }
    }
    Ok(sessions)
}

/// Scan every CAN bus in parallel. A failing bus is logged and yields no
/// sessions; other buses are unaffected.
pub async fn discover_can() -> Vec<TouchEncoder> {
    let interfaces = can_interfaces();
    if interfaces.is_empty() {
        return Vec::new();
    }
    let mut tasks = JoinSet::new();
    for interface in interfaces {
        tasks.spawn(async move {
            match scan_bus(&interface).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("CAN interface {interface} is down or unusable: {e}");
                    Vec::new()
                }
            }
        });
    }
    let mut sessions = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(mut bus_sessions) => sessions.append(&mut bus_sessions),
            Err(e) => warn!("bus scan task failed: {e}"),
        }
    }
    sessions
}

/// Discover Touch Encoders on every available transport.
pub async fn discover_all() -> Vec<TouchEncoder> {
    let mut sessions = discover_can().await;
    match discover_hid().await {
        Ok(mut hid_sessions) => sessions.append(&mut hid_sessions),
        Err(e) => warn!("USB enumeration failed: {e}"),
    }
    sessions
}
