//! J1939 Touch Encoder session: command framing, response correlation,
//! authentication and the restart/update state machines over a controller
//! application.

pub mod ca;
pub mod guide;
pub mod kernel;
pub mod messages;
pub mod name;
pub mod pgn;
pub mod tp;
pub mod universal;

use crate::constants::{
    COMMAND_LEN, J1939_MTU, RESPONSE_TIMEOUT, RESTART_TIMEOUT, UPDATE_TASK_TIMEOUT, UPDATE_TIMEOUT,
    cmd,
};
use crate::error::{Result, TeError};
use crate::types::{
    AuthState, Clearance, HardwareId, ProjectInfo, Status, Version, auth_response,
};
use crate::update::{
    ComponentStatus, ComponentType, UpdateState, UpdateStatus, UpdateStatusType, UploadError,
};
use ca::{Ca, ControllerApp, Message};
use messages::{
    AckCode, AckMsg, AddressClaimMsg, AuthMsg, HardwareIdMsg, ProjectInfoMsg, SoftwareIdMsg,
    UpdateAckMsg, UpdateStatusMsg,
};
use name::Name;
use num_enum::TryFromPrimitive;
use pgn::{Pgn, std_pgn, te_pgn};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long after a wait for the status frames that follow the upload before
/// the machine gives up on the device starting the apply phase.
const UPDATE_START_TIMEOUT: Duration = Duration::from_secs(10);

/// NAME field selected by a `CONFIGURE_NAME` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConfigureNameSelector {
    IndustryGroup = 1,
    VehicleSystemInstance = 2,
    VehicleSystem = 3,
    Function = 5,
    FunctionInstance = 6,
    EcuInstance = 7,
}

/// A Touch Encoder reached over a CAN bus.
///
/// The device may re-claim a different source address after a restart; the
/// session tracks the current address and NAME, and callers must not cache
/// the old address.
pub struct J1939TouchEncoder<C: ControllerApp = Ca> {
    ca: C,
    address: u8,
    name: Name,
    response_pgn: Pgn,
    pub version: Version,
    pub hardware_id: Option<HardwareId>,
    pub project_info: ProjectInfo,
}

impl<C: ControllerApp> J1939TouchEncoder<C> {
    pub fn new(ca: C, address: u8, name: Name) -> Self {
        Self {
            ca,
            address,
            name,
            response_pgn: te_pgn::GUIDE,
            version: Version::default(),
            hardware_id: None,
            project_info: ProjectInfo::default(),
        }
    }

    /// `<can_iface>:<hex_addr>`.
    pub fn interface_id(&self) -> String {
        format!("{}:{:#x}", self.ca.interface_name(), self.address)
    }

    /// Current device source address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Device NAME from the most recent address claim.
    pub fn name(&self) -> Name {
        self.name
    }

    pub fn controller(&self) -> &C {
        &self.ca
    }

    /// The utility app NACKs raw-input-event configuration.
    pub async fn in_utility_app(&mut self) -> bool {
        self.set_raw_input_event(true, None).await == Status::Nack
    }

    pub async fn disconnect(&mut self) {
        self.ca.disconnect().await;
    }

    /// Send an 8-byte command payload as PROPRIETARY_A to the device.
    pub async fn send_command(&mut self, command: &[u8]) -> Result<usize> {
        let mut payload = [0u8; COMMAND_LEN];
        payload[..command.len()].copy_from_slice(command);
        self.ca.send_to(std_pgn::PROPRIETARY_A, self.address, &payload).await
    }

    /// Correlate a response: pop frames until `parse` accepts one or the
    /// deadline passes. Frames stamped before `since` are dropped, which is
    /// how callers skip traffic buffered during an earlier command.
    pub async fn await_response<T>(
        &mut self,
        timeout: Duration,
        since: Option<Instant>,
        parse: impl Fn(&Message) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let Some(msg) = self.ca.recv_msg(deadline - now).await else {
                continue;
            };
            if let Some(since) = since {
                if msg.timestamp < since {
                    continue;
                }
            }
            if let Some(parsed) = parse(&msg) {
                return Some(parsed);
            }
            debug!("dropping unexpected {} from {:#04x}", msg.pgn(), msg.sa());
        }
    }

    /// Service-tool challenge/response. The shared secret on CAN is the
    /// host CA's own source address.
    pub async fn authenticate(&mut self, clearance: Clearance) -> Status {
        let mut command = [0u8; COMMAND_LEN];
        command[0] = cmd::ST_AUTH;
        command[1] = clearance as u8;
        command[2..5].copy_from_slice(&te_pgn::AUTHENTICATION.to_bytes());
        if let Err(e) = self.send_command(&command).await {
            warn!("auth request failed: {e}");
            return Status::Error;
        }

        let device = self.address;
        let Some(msg) = self
            .await_response(RESPONSE_TIMEOUT, None, |m| AuthMsg::parse(m, device))
            .await
        else {
            return Status::Error;
        };
        match msg.state {
            AuthState::Complete => return Status::Success,
            AuthState::Challenge => {}
            _ => return Status::AuthRequestFailed,
        }

        let response = auth_response(clearance, self.ca.address() as u32, msg.challenge);
        let mut payload = [0u8; 5];
        payload[0] = AuthState::Response as u8;
        payload[1..5].copy_from_slice(&response.to_le_bytes());
        if let Err(e) = self
            .ca
            .send_to(te_pgn::AUTHENTICATION, self.address, &payload)
            .await
        {
            warn!("auth response failed: {e}");
            return Status::Error;
        }

        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| AuthMsg::parse(m, device))
            .await
        {
            Some(msg) if msg.state == AuthState::Complete => Status::Success,
            _ => Status::AuthChallengeFailed,
        }
    }

    /// Request the SOFTWARE_ID parameter group and parse the version reply.
    pub async fn refresh_version_info(&mut self) -> Status {
        self.version = Version::default();
        if let Err(e) = self
            .ca
            .send_to(
                std_pgn::PGN_REQUEST,
                self.address,
                &std_pgn::SOFTWARE_ID.to_bytes(),
            )
            .await
        {
            warn!("version request failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| SoftwareIdMsg::parse(m, device))
            .await
        {
            Some(msg) => {
                self.version = msg.version;
                Status::Success
            }
            None => Status::Error,
        }
    }

    pub async fn refresh_hardware_info(&mut self) -> Status {
        self.hardware_id = None;
        if let Err(e) = self.send_command(&[cmd::GET_HARDWARE_ID]).await {
            warn!("hardware info request failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| HardwareIdMsg::parse(m, device))
            .await
        {
            Some(msg) => {
                self.hardware_id = Some(msg.hardware_id);
                Status::Success
            }
            None => Status::Error,
        }
    }

    pub async fn refresh_project_info(&mut self) -> Status {
        self.project_info = ProjectInfo::default();
        if let Err(e) = self.send_command(&[cmd::GET_PROJECT_INFO]).await {
            warn!("project info request failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| ProjectInfoMsg::parse(m, device))
            .await
        {
            Some(msg) => {
                self.project_info = msg.project_info;
                Status::Success
            }
            None => Status::Error,
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
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| {
                AckMsg::parse_for(m, device, cmd::BRIGHTNESS)
            })
            .await
        {
            Some(ack) if ack.code == AckCode::Ok => Status::Success,
            _ => Status::Error,
        }
    }

    /// Enable or disable the raw-input-event stream, optionally steering it
    /// to a different PGN.
    pub async fn set_raw_input_event(&mut self, enable: bool, rie_pgn: Option<Pgn>) -> Status {
        let mut command = [0u8; 5];
        command[0] = cmd::RIE;
        command[1] = enable as u8;
        if let Some(pgn) = rie_pgn {
            command[2..5].copy_from_slice(&pgn.to_bytes());
        }
        if let Err(e) = self.send_command(&command).await {
            warn!("raw input event command failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| {
                AckMsg::parse_for(m, device, cmd::RIE)
            })
            .await
        {
            Some(ack) if ack.code == AckCode::Ok => Status::Success,
            Some(ack) if ack.code == AckCode::Nack => Status::Nack,
            _ => Status::Error,
        }
    }

    /// Restart the device, optionally into the utility app, and (by default)
    /// wait for it to come back via a fresh address claim.
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
        // Ignore any ack still buffered from before this command.
        let since = Instant::now();
        if let Err(e) = self.send_command(&[opcode]).await {
            warn!("restart command failed: {e}");
            return Status::Error;
        }

        let device = self.address;
        let Some(ack) = self
            .await_response(RESPONSE_TIMEOUT, Some(since), |m| {
                AckMsg::parse_for(m, device, opcode)
            })
            .await
        else {
            return Status::Error;
        };
        match ack.code {
            AckCode::AccessDenied => return Status::AccessDenied,
            AckCode::Ok => {}
            _ => return Status::Error,
        }
        if !wait {
            return Status::Success;
        }

        // The device may come back on a different source address.
        match self
            .await_response(RESTART_TIMEOUT, None, AddressClaimMsg::parse)
            .await
        {
            Some(claim) => {
                self.address = claim.sa;
                self.name = claim.name;
                Status::Success
            }
            None => Status::RestartTimeout,
        }
    }

    /// Rewrite one field of the device's J1939 NAME. Requires service-tool
    /// clearance; the device restarts to apply the change.
    pub async fn configure_name(
        &mut self,
        selector: ConfigureNameSelector,
        value: u32,
        authenticate: bool,
    ) -> Status {
        if authenticate {
            let status = self.authenticate(Clearance::ServiceTool).await;
            if status != Status::Success {
                return status;
            }
        }
        let bytes = value.to_le_bytes();
        let command = [cmd::CONFIGURE_NAME, selector as u8, bytes[0], bytes[1], bytes[2]];
        if let Err(e) = self.send_command(&command).await {
            warn!("configure name failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        let Some(ack) = self
            .await_response(RESPONSE_TIMEOUT, None, |m| {
                AckMsg::parse_for(m, device, cmd::CONFIGURE_NAME)
            })
            .await
        else {
            return Status::Error;
        };
        match ack.code {
            AckCode::Nack => Status::Nack,
            AckCode::AccessDenied => Status::AccessDenied,
            AckCode::CantRespond => Status::Error,
            AckCode::Ok => self.restart(false, true, false).await,
        }
    }

    /// Upload and apply a firmware/project package. See the crate docs for
    /// the state machine; `progress` fires on every transition and tick.
    pub async fn update<F>(&mut self, filepath: &Path, progress: &mut F) -> Result<UpdateStatus>
    where
        F: FnMut(UpdateState, Option<u64>, Option<u64>),
    {
        self.update_with_session_pgn(filepath, progress, te_pgn::LIVE_UPDATE)
            .await
    }

    pub async fn update_with_session_pgn<F>(
        &mut self,
        filepath: &Path,
        progress: &mut F,
        session_pgn: Pgn,
    ) -> Result<UpdateStatus>
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
        command[5..8].copy_from_slice(&session_pgn.to_bytes());
        if let Err(e) = self.send_command(&command).await {
            warn!("update request failed: {e}");
            return Ok(UpdateStatus::Error);
        }

        let device = self.address;
        let update_deadline = Instant::now() + UPDATE_TIMEOUT;
        let mut task_deadline = Instant::now() + Duration::from_secs(1);
        let mut state = UpdateState::UpdateConfirmation;
        progress(state, None, None);

        let mut update_status = UpdateStatus::Error;
        let mut file: Option<tokio::fs::File> = None;
        let mut uploaded: u64 = 0;
        let mut chunk = vec![0u8; J1939_MTU];

        let timed_out = loop {
            let now = Instant::now();
            if now >= update_deadline || now >= task_deadline {
                break true;
            }
            let frame_wait = task_deadline.min(update_deadline) - now;

            match state {
                UpdateState::UpdateConfirmation => {
                    let Some(msg) = self.ca.recv_msg(frame_wait).await else {
                        continue;
                    };
                    let Some(ack) = UpdateAckMsg::parse(&msg, device) else {
                        continue;
                    };
                    task_deadline = update_deadline;
                    // CAN accepts with 0; 2 = rejected, 3 = busy.
                    match ack.status {
                        0 => match tokio::fs::File::open(filepath).await {
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
                    // The device only speaks up here to report trouble.
                    let poll = if file.is_some() { Duration::ZERO } else { frame_wait };
                    if let Some(msg) = self.ca.recv_msg(poll).await {
                        if let Some(status) = UpdateStatusMsg::parse(&msg, device, session_pgn) {
                            if status.err() != UploadError::Ok {
                                state = UpdateState::UploadError;
                                progress(state, None, None);
                                break false;
                            }
                            state = UpdateState::Updating;
                            progress(state, None, None);
                            task_deadline = Instant::now() + UPDATE_START_TIMEOUT;
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
                    let sent = match self.ca.send_to(session_pgn, device, &chunk[..read]).await {
                        Ok(sent) => sent,
                        Err(e) => {
                            warn!("chunk send failed: {e}");
                            0
                        }
                    };
                    if sent != read {
                        state = UpdateState::UploadError;
                        progress(state, None, None);
                        break false;
                    }
                    uploaded += read as u64;
                    progress(state, Some(uploaded), Some(file_size));
                }
                UpdateState::Updating => {
                    let Some(msg) = self.ca.recv_msg(frame_wait).await else {
                        continue;
                    };
                    let Some(status) = UpdateStatusMsg::parse(&msg, device, session_pgn) else {
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
