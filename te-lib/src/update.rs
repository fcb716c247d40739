//! Firmware/project update protocol vocabulary.

use num_enum::TryFromPrimitive;
use std::path::Path;
use strum_macros::Display;

/// Internal state of the upload+apply machine. Reported through the progress
/// callback on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UpdateState {
    Error,
    UpdateRequest,
    UpdateConfirmation,
    UpdateRejected,
    DeviceBusy,
    FileUpload,
    UploadError,
    Updating,
    UpdatingBootloader,
    UpdatingFirmware,
    UpdatingProject,
    Success,
    Rebooting,
}

impl UpdateState {
    /// Progress-reporting state for a component status frame.
    pub fn from_component_type(component: ComponentType) -> Self {
        match component {
            ComponentType::Bootloader => UpdateState::UpdatingBootloader,
            ComponentType::Firmware => UpdateState::UpdatingFirmware,
            ComponentType::Project => UpdateState::UpdatingProject,
            _ => UpdateState::Updating,
        }
    }
}

/// Component being updated, also the package kind announced in the
/// `LIVE_UPDATE` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, Display)]
#[repr(i8)]
pub enum ComponentType {
    Unknown = -1,
    Package = 0,
    Bootloader = 1,
    Firmware = 2,
    Project = 3,
}

impl ComponentType {
    /// Package kind from the file extension: `.tepkg` is a full package,
    /// `.zip` a project-only update. Anything else is rejected up front.
    pub fn from_filename(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("zip") => ComponentType::Project,
            Some("tepkg") => ComponentType::Package,
            _ => ComponentType::Unknown,
        }
    }
}

/// Per-component progress markers inside a COMPONENT status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ComponentStatus {
    Busy = 0xB1,
    Progress = 0x30,
    End = 0xF1,
}

/// Outward result of an update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, Display)]
#[repr(i8)]
pub enum UpdateStatus {
    Failure = -2,
    Error = -1,
    Ongoing = 0,
    Success = 1,
    SuccessRestart = 2,
    SuccessUptodate = 3,
    Timeout = 4,
}

impl UpdateStatus {
    pub fn is_success(self) -> bool {
        self as i8 >= UpdateStatus::Success as i8
    }
}

/// Discriminator selecting the wire layout of an incoming status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum UpdateStatusType {
    Upload = 1,
    Update = 2,
    Component = 3,
}

/// Upload error codes reported during the file transfer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum UploadError {
    Ok = 0,
    Unknown = 1,
    Timeout = 2,
    Overflow = 3,
    IoError = 4,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn component_type_from_extension() {
        assert_eq!(
            ComponentType::from_filename(Path::new("fw/release-2.1.0.tepkg")),
            ComponentType::Package
        );
        assert_eq!(
            ComponentType::from_filename(Path::new("project.zip")),
            ComponentType::Project
        );
        assert_eq!(
            ComponentType::from_filename(Path::new("firmware.bin")),
            ComponentType::Unknown
        );
        assert_eq!(ComponentType::from_filename(Path::new("tepkg")), ComponentType::Unknown);
    }

    #[test]
    fn update_status_success_floor() {
        assert!(UpdateStatus::Success.is_success());
        assert!(UpdateStatus::SuccessRestart.is_success());
        assert!(UpdateStatus::SuccessUptodate.is_success());
        assert!(!UpdateStatus::Ongoing.is_success());
        assert!(!UpdateStatus::Failure.is_success());
    }
}
