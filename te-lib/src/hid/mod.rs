//! HID Touch Encoder session: command framing, response correlation,
//! authentication and the restart/update state machines over the USB
//! transport.

pub mod guide;
pub mod reports;
pub mod transport;

use crate::constants::{
    COMMAND_LEN, MAX_UPLOAD_CHUNK, RESPONSE_TIMEOUT, RESTART_TIMEOUT, UPDATE_TASK_TIMEOUT,
    UPDATE_TIMEOUT, cmd, context, report_id,
};
use crate::error::{Result, TeError};
use crate::types::{AuthState, Clearance, HardwareId, ProjectInfo, Status, Version, auth_response};
use crate::update::{
    ComponentStatus, ComponentType, UpdateState, UpdateStatus, UpdateStatusType, UploadError,
};
use reports::{
    AckReport, AuthReport, ContextSensitiveReport, HardwareIdReport, HidAckCode,
    ProjectInfoReport, ReportFrame, UpdateAckReport, UpdateStatusReport, VersionFeatureReport,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use transport::{HidEndpoint, HidIo, UsbHidTransport, wait_for_arrival};
use tracing::{debug, warn};

/// Fixed shared secret of the HID service-tool challenge.
const HID_AUTH_SECRET: u32 = 0x1337;

/// Restart acks can take noticeably longer over HID than CAN.
const RESTART_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// A Touch Encoder reached over USB HID.
pub struct HidTouchEncoder<T: HidIo = UsbHidTransport> {
    transport: T,
    pub version: Version,
    pub hardware_id: Option<HardwareId>,
    pub project_info: ProjectInfo,
}

impl HidTouchEncoder<UsbHidTransport> {
    /// Open the Touch Encoder with the given serial number (any when empty).
    pub async fn open(serial: &str) -> Result<Self> {
        Ok(Self::new(UsbHidTransport::open(serial).await?))
    }

    /// Wrap an already-enumerated device.
    pub async fn open_from(info: &nusb::DeviceInfo) -> Result<Self> {
        Ok(Self::new(UsbHidTransport::open_from(info).await?))
    }
}

impl<T: HidIo> HidTouchEncoder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            version: Version::default(),
            hardware_id: None,
            project_info: ProjectInfo::default(),
        }
    }

    /// `usb:<serial>`.
    pub fn interface_id(&self) -> String {
        format!("usb:{}", self.transport.serial())
    }

    /// The utility app exposes no widget interface.
    pub fn in_utility_app(&self) -> bool {
        !self.transport.has_widget()
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    /// Send a command on the command channel, framed as `[0x02][opcode][p…]`.
    pub async fn send_command(&mut self, command: &[u8]) -> Result<usize> {
        let mut report = [0u8; COMMAND_LEN + 1];
        report[0] = 0x02;
        report[1..1 + command.len()].copy_from_slice(command);
        self.transport.send(HidEndpoint::Cmd, &report).await
    }

    /// Send a raw command on the widget channel; returns 0 when the widget
    /// interface is absent.
    pub async fn send_widget_command(&mut self, command: &[u8]) -> Result<usize> {
        self.transport.send(HidEndpoint::Widget, command).await
    }

    /// Correlate a response: pop frames until `parse` accepts one or the
    /// deadline passes. Frames stamped before `since` are dropped.
    pub async fn await_response<R>(
        &mut self,
        timeout: Duration,
        since: Option<Instant>,
        parse: impl Fn(&ReportFrame) -> Option<R>,
    ) -> Option<R> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let Some(frame) = self.transport.recv_report(deadline - now).await else {
                continue;
            };
            if let Some(since) = since {
                if frame.timestamp < since {
                    continue;
                }
            }
            if let Some(parsed) = parse(&frame) {
                return Some(parsed);
            }
            debug!("dropping unexpected report {:#04x}", frame.report_id());
        }
    }

    /// Service-tool challenge/response over the AUTH context-sensitive
    /// channel. The HID secret is a fixed constant.
    pub async fn authenticate(&mut self, clearance: Clearance) -> Status {
        if let Err(e) = self
            .send_command(&[cmd::ST_AUTH, clearance as u8, context::AUTH])
            .await
        {
            warn!("auth request failed: {e}");
            return Status::Error;
        }
        let Some(report) = self
            .await_response(RESPONSE_TIMEOUT, None, AuthReport::parse)
            .await
        else {
            return Status::Error;
        };
        match report.state {
            AuthState::Complete => return Status::Success,
            AuthState::Challenge => {}
            _ => return Status::AuthRequestFailed,
        }

        let response = auth_response(clearance, HID_AUTH_SECRET, report.challenge);
        let mut payload = [0u8; 5];
        payload[0] = AuthState::Response as u8;
        payload[1..5].copy_from_slice(&response.to_le_bytes());
        let frame = match ContextSensitiveReport::encode(context::AUTH, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("auth response framing failed: {e}");
                return Status::Error;
            }
        };
        if let Err(e) = self.transport.send(HidEndpoint::Cmd, &frame).await {
            warn!("auth response failed: {e}");
            return Status::Error;
        }

        match self
            .await_response(RESPONSE_TIMEOUT, None, AuthReport::parse)
            .await
        {
            Some(report) if report.state == AuthState::Complete => Status::Success,
            _ => Status::AuthChallengeFailed,
        }
    }

    /// Read the FW/BL/project versions from the sw-ver feature reports.
    pub async fn refresh_version_info(&mut self) -> Status {
        self.version = Version::default();
        self.version.firmware = self.feature_version(report_id::FW_VER).await;
        self.version.bootloader = self.feature_version(report_id::BL_VER).await;
        self.version.project = self.feature_version(report_id::PROJ_VER).await;
        Status::Success
    }

    async fn feature_version(&mut self, report: u8) -> String {
        match self.transport.get_feature_report(report, 7).await {
            Ok(raw) => VersionFeatureReport::version_string(&raw)
                .unwrap_or_else(|| crate::types::VERSION_NOT_FOUND.to_string()),
            Err(e) => {
                debug!("feature report {report} unavailable: {e}");
                crate::types::VERSION_NOT_FOUND.to_string()
            }
        }
    }

    pub async fn refresh_hardware_info(&mut self) -> Status {
        self.hardware_id = None;
        if let Err(e) = self.send_command(&[cmd::GET_HARDWARE_ID]).await {
            warn!("hardware info request failed: {e}");
            return Status::Error;
        }
        match self
            .await_response(RESPONSE_TIMEOUT, None, HardwareIdReport::parse)
            .await
        {
            Some(report) if report.code == HidAckCode::Ok => {
                self.hardware_id = Some(report.hardware_id);
                Status::Success
            }
            _ => Status::Error,
        }
    }

    pub async fn refresh_project_info(&mut self) -> Status {
        self.project_info = ProjectInfo::default();
        if let Err(e) = self.send_command(&[cmd::GET_PROJECT_INFO]).await {
            warn!("project info request failed: {e}");
            return Status::Error;
        }
        match self
            .await_response(RESPONSE_TIMEOUT, None, ProjectInfoReport::parse)
            .await
        {
            Some(report) if report.code == HidAckCode::Ok => {
                self.project_info = report.project_info;
                Status::Success
            }
            _ => Status::Error,
        }
    }

    /// Refresh version, hardware and project info in one go.
    pub async fn refresh_info(&mut self) -> Status {
        let ok = self.refresh_version_info().await.is_success()
            & self.refresh_hardware_info().await.is_success()
            & self.refresh_project_info().await.is_success();
        if ok { Status::Success } else { Status::Error }
    }

    pub async fn set_brightness(&mut self, level: u8, store: bool) -> Status {
        let level_byte = (level & 0x7F) | ((store as u8) << 7);
        if let Err(e) = self.send_command(&[cmd::BRIGHTNESS, 0x00, level_byte]).await {
            warn!("brightness command failed: {e}");
            return Status::Error;
        }
        match self
            .await_response(RESPONSE_TIMEOUT, None, |f| {
                AckReport::parse_for(f, cmd::BRIGHTNESS)
            })
            .await
        {
            Some(ack) if ack.code == HidAckCode::Ok => Status::Success,
            _ => Status::Error,
        }
    }

    pub async fn set_raw_input_event(&mut self, enable: bool) -> Status {
        if let Err(e) = self.send_command(&[cmd::RIE, enable as u8]).await {
            warn!("raw input event command failed: {e}");
            return Status::Error;
        }
        match self
            .await_response(RESPONSE_TIMEOUT, None, |f| AckReport::parse_for(f, cmd::RIE))
            .await
        {
            Some(ack) if ack.code == HidAckCode::Ok => Status::Success,
            _ => Status::Error,
        }
    }

    /// Restart the device, optionally into the utility app, and (by default)
    /// wait for the USB re-enumeration before returning.
    pub async fn restart(&mut self, to_utility: bool, wait: bool, authenticate: bool) -> Status {
        if to_utility && authenticate {
            let status = self.authenticate(Clearance::ServiceTool).await;
            if status != Status::Success {
                return status;
            }
        }
        let opcode = if to_utility {
            cmd::RESTART_UTILITY_APP
        } else {
            cmd::RESTART
        };
        let since = Instant::now();
        if let Err(e) = self.send_command(&[opcode]).await {
            warn!("restart command failed: {e}");
            return Status::Error;
        }
        let Some(ack) = self
            .await_response(RESTART_ACK_TIMEOUT, Some(since), |f| {
                AckReport::parse_for(f, opcode)
            })
            .await
        else {
            return Status::Error;
        };
        match ack.code {
            HidAckCode::AccDenied => return Status::AccessDenied,
            HidAckCode::Ok => {}
            _ => return Status::Error,
        }
        if !wait {
            return Status::Success;
        }
        self.await_restart(RESTART_TIMEOUT).await
    }

    /// Drop the USB handles, wait for the device to re-enumerate, reopen.
    async fn await_restart(&mut self, timeout: Duration) -> Status {
        self.transport.disconnect().await;
        let deadline = Instant::now() + timeout;
        let serial = self.transport.serial().to_string();
        if !wait_for_arrival(&serial, deadline).await {
            return Status::RestartTimeout;
        }
        match self.transport.reconnect().await {
            Ok(()) => Status::Success,
            Err(e) => {
                warn!("usb:{serial}: reconnect after restart failed: {e}");
                Status::RestartTimeout
            }
        }
    }

    /// Upload and apply a firmware/project package; `progress` fires on
    /// every transition and tick.
    pub async fn update<F>(&mut self, filepath: &Path, progress: &mut F) -> Result<UpdateStatus>
    where
        F: FnMut(UpdateState, Option<u64>, Option<u64>),
    {
        let component = ComponentType::from_filename(filepath);
        if component == ComponentType::Unknown {
            progress(UpdateState::UpdateRejected, None, None);
            return Ok(UpdateStatus::Error);
        }
        let file_size = tokio::fs::metadata(filepath).await?.len();
        if file_size >= 1 << 24 {
            return Err(TeError::UnsupportedPackage(format!(
                "{} is too large to announce ({file_size} bytes)",
                filepath.display()
            )));
        }

        progress(UpdateState::UpdateRequest, None, None);
        let size_bytes = (file_size as u32).to_le_bytes();
        let mut command = [0u8; COMMAND_LEN];
        command[0] = cmd::LIVE_UPDATE;
        command[1] = component as i8 as u8;
        command[2..5].copy_from_slice(&size_bytes[..3]);
        if let Err(e) = self.send_command(&command).await {
            warn!("update request failed: {e}");
            return Ok(UpdateStatus::Error);
        }

        let update_deadline = Instant::now() + UPDATE_TIMEOUT;
        let mut task_deadline = Instant::now() + Duration::from_secs(1);
        let mut state = UpdateState::UpdateConfirmation;
        progress(state, None, None);

        let mut update_status = UpdateStatus::Error;
        let mut file: Option<tokio::fs::File> = None;
        let mut uploaded: u64 = 0;
        let mut chunk = vec![0u8; MAX_UPLOAD_CHUNK];

        let timed_out = loop {
            let now = Instant::now();
            if now >= update_deadline || now >= task_deadline {
                break true;
            }
            let frame_wait = task_deadline.min(update_deadline) - now;

            match state {
                UpdateState::UpdateConfirmation => {
                    let Some(frame) = self.transport.recv_report(frame_wait).await else {
                        continue;
                    };
                    let Some(ack) = UpdateAckReport::parse(&frame) else {
                        continue;
                    };
                    task_deadline = update_deadline;
                    // HID accepts with 1; 2 = rejected, 3 = busy.
                    match ack.status {
                        1 => match tokio::fs::File::open(filepath).await {
                            Ok(stream) => {
                                file = Some(stream);
                                uploaded = 0;
                                state = UpdateState::FileUpload;
                                progress(state, Some(0), Some(file_size));
                            }
                            Err(e) => {
                                warn!("could not open {}: {e}", filepath.display());
                                state = UpdateState::UploadError;
                                progress(state, None, None);
                                break false;
                            }
                        },
                        2 => {
                            state = UpdateState::UpdateRejected;
                            progress(state, None, None);
                            break false;
                        }
                        3 => {
                            state = UpdateState::DeviceBusy;
                            progress(state, None, None);
                            break false;
                        }
                        _ => {
                            state = UpdateState::Error;
                            progress(state, None, None);
                            break false;
                        }
                    }
                }
                UpdateState::FileUpload => {
                    // An early status frame either aborts the upload or
                    // (err == OK) fast-forwards to the apply phase.
                    let poll = if file.is_some() { Duration::ZERO } else { frame_wait };
                    if let Some(frame) = self.transport.recv_report(poll).await {
                        if let Some(status) = UpdateStatusReport::parse(&frame) {
                            if status.err() != UploadError::Ok {
                                state = UpdateState::UploadError;
                                progress(state, None, None);
                                break false;
                            }
                            state = UpdateState::Updating;
                            progress(state, None, None);
                            continue;
                        }
                    }
                    let Some(stream) = file.as_mut() else {
                        continue;
                    };
                    let read = match stream.read(&mut chunk).await {
                        Ok(read) => read,
                        Err(e) => {
                            warn!("package read failed: {e}");
                            state = UpdateState::UploadError;
                            progress(state, None, None);
                            break false;
                        }
                    };
                    if read == 0 {
                        file = None;
                        task_deadline = Instant::now() + UPDATE_TASK_TIMEOUT;
                        continue;
                    }
                    let mut report = Vec::with_capacity(3 + read);
                    report.push(report_id::UPDATE_DATA);
                    report.extend_from_slice(&(read as u16).to_le_bytes());
                    report.extend_from_slice(&chunk[..read]);
                    let sent = match self.transport.send_update_payload(&report).await {
                        Ok(sent) => sent,
                        Err(e) => {
                            warn!("chunk send failed: {e}");
                            0
                        }
                    };
                    if sent != report.len() {
                        state = UpdateState::UploadError;
                        progress(state, None, None);
                        break false;
                    }
                    uploaded += read as u64;
                    progress(state, Some(uploaded), Some(file_size));
                }
                UpdateState::Updating => {
                    let Some(frame) = self.transport.recv_report(frame_wait).await else {
                        continue;
                    };
                    let Some(status) = UpdateStatusReport::parse(&frame) else {
                        continue;
                    };
                    match status.status_type {
                        UpdateStatusType::Component => {
                            task_deadline = Instant::now() + UPDATE_TASK_TIMEOUT;
                            if status.component_status() == Some(ComponentStatus::Progress) {
                                progress(
                                    UpdateState::from_component_type(status.component_type()),
                                    Some(status.component_progress() as u64),
                                    Some(100),
                                );
                            }
                        }
                        UpdateStatusType::Update => {
                            let Some(result) = status.update_status() else {
                                continue;
                            };
                            if result != UpdateStatus::Ongoing {
                                update_status = result;
                                state = if result.is_success() {
                                    UpdateState::Success
                                } else {
                                    UpdateState::Error
                                };
                                progress(state, None, None);
                                break false;
                            }
                        }
                        UpdateStatusType::Upload => {}
                    }
                }
                _ => break false,
            }
        };

        if timed_out {
            return Ok(UpdateStatus::Timeout);
        }
        if state == UpdateState::Success && update_status != UpdateStatus::SuccessUptodate {
            progress(UpdateState::Rebooting, None, None);
            self.restart(false, true, false).await;
        }
        Ok(update_status)
    }
}
