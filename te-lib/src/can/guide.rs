//! GUIDE screen/variable operations over J1939.

use crate::can::J1939TouchEncoder;
use crate::can::ca::ControllerApp;
use crate::can::messages::{AckCode, AckMsg, GuideResponseMsg};
use crate::can::pgn::{PGN_MASK, Pgn, std_pgn};
use crate::constants::RESPONSE_TIMEOUT;
use crate::error::{Result, TeError};
use crate::guide::guide_cmd;
use crate::types::{ScreenId, Status, VariableData, VariableId};
use tracing::warn;

/// GUIDE request opcodes carried in PROPRIETARY_A commands.
pub const GUIDE_GET: u8 = 0x0A;
pub const GUIDE_SET: u8 = 0x0B;
/// Reconfigures the PGN the device answers GUIDE requests on.
pub const PGN_CONFIG: u8 = 0xD9;

enum GuideReply {
    Guide(GuideResponseMsg),
    Ack(AckMsg),
}

impl<C: ControllerApp> J1939TouchEncoder<C> {
    /// PGN the device currently answers GUIDE requests on.
    pub fn response_pgn(&self) -> Pgn {
        self.response_pgn
    }

    /// Point GUIDE responses at a different PGN. The device masks the value
    /// to the 18-bit range.
    pub async fn set_response_pgn(&mut self, pgn: Option<Pgn>) -> Status {
        if let Some(pgn) = pgn {
            self.response_pgn = Pgn::new(pgn.value() & PGN_MASK);
        }
        let response_pgn = self.response_pgn;
        let mut command = [0u8; 4];
        command[0] = PGN_CONFIG;
        command[1..4].copy_from_slice(&response_pgn.to_bytes());
        if let Err(e) = self.send_command(&command).await {
            warn!("PGN config failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        match self
            .await_response(RESPONSE_TIMEOUT, None, |m| AckMsg::parse(m, device))
            .await
        {
            Some(ack) if ack.code == AckCode::Nack => Status::Nack,
            Some(ack) if ack.code == AckCode::Ok && ack.group_function == PGN_CONFIG => {
                Status::Success
            }
            _ => Status::Error,
        }
    }

    /// ID of the screen currently shown on the device.
    pub async fn get_screen(&mut self) -> Result<ScreenId> {
        self.send_command(&[GUIDE_GET, guide_cmd::SCREEN]).await?;
        let device = self.address;
        let response_pgn = self.response_pgn;
        self.await_response(RESPONSE_TIMEOUT, None, |m| {
            GuideResponseMsg::parse(m, device, response_pgn, guide_cmd::SCREEN, None, None)
        })
        .await
        .map(|msg| msg.screen_id)
        .ok_or(TeError::NoResponse)
    }

    /// Switch the device to `screen_id`. Success is the echoed screen
    /// report; a NACK ack means the device refused.
    pub async fn set_screen(&mut self, screen_id: ScreenId) -> Status {
        if let Err(e) = self
            .send_command(&[GUIDE_SET, guide_cmd::SCREEN, screen_id.value()])
            .await
        {
            warn!("set screen failed: {e}");
            return Status::Error;
        }
        let device = self.address;
        let response_pgn = self.response_pgn;
        let reply = self
            .await_response(RESPONSE_TIMEOUT, None, |m| {
                GuideResponseMsg::parse(
                    m,
                    device,
                    response_pgn,
                    guide_cmd::SCREEN,
                    Some(screen_id),
                    None,
                )
                .map(GuideReply::Guide)
                .or_else(|| AckMsg::parse(m, device).map(GuideReply::Ack))
            })
            .await;
        match reply {
            Some(GuideReply::Guide(_)) => Status::Success,
            Some(GuideReply::Ack(ack)) if ack.code == AckCode::Nack => Status::Nack,
            _ => Status::Error,
        }
    }

    /// Read a variable's value from the given screen.
    pub async fn get_var(
        &mut self,
        screen_id: ScreenId,
        variable_id: VariableId,
    ) -> Result<VariableData> {
        self.send_command(&[
            GUIDE_GET,
            guide_cmd::VARIABLE,
            screen_id.value(),
            variable_id.value(),
        ])
        .await?;
        let device = self.address;
        let response_pgn = self.response_pgn;
        self.await_response(RESPONSE_TIMEOUT, None, |m| {
            GuideResponseMsg::parse(
                m,
                device,
                response_pgn,
                guide_cmd::VARIABLE,
                Some(screen_id),
                Some(variable_id),
            )
        })
        .await
        .and_then(|msg| msg.value)
        .ok_or(TeError::NoResponse)
    }

    /// Write a variable. Values longer than four bytes ride the transport
    /// protocol transparently. Success is an echoed int/string variable
    /// notification for the same `(screen, variable)` pair.
    pub async fn set_var(
        &mut self,
        screen_id: ScreenId,
        variable_id: VariableId,
        data: &VariableData,
    ) -> Status {
        let mut command = Vec::with_capacity(4 + data.as_bytes().len());
        command.extend_from_slice(&[
            GUIDE_SET,
            guide_cmd::VARIABLE,
            screen_id.value(),
            variable_id.value(),
        ]);
        command.extend_from_slice(data.as_bytes());
        // Sent raw (not zero-padded) so long values fragment correctly.
        let device = self.address;
        let sent = match self
            .ca
            .send_to(std_pgn::PROPRIETARY_A, device, &command)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                warn!("set variable failed: {e}");
                return Status::Error;
            }
        };
        if sent != command.len() {
            return Status::Error;
        }

        let response_pgn = self.response_pgn;
        let reply = self
            .await_response(RESPONSE_TIMEOUT, None, |m| {
                GuideResponseMsg::parse(
                    m,
                    device,
                    response_pgn,
                    guide_cmd::INT_VARIABLE,
                    Some(screen_id),
                    Some(variable_id),
                )
                .or_else(|| {
                    GuideResponseMsg::parse(
                        m,
                        device,
                        response_pgn,
                        guide_cmd::STRING_VARIABLE,
                        Some(screen_id),
                        Some(variable_id),
                    )
                })
                .map(GuideReply::Guide)
                .or_else(|| AckMsg::parse(m, device).map(GuideReply::Ack))
            })
            .await;
        match reply {
            Some(GuideReply::Guide(_)) => Status::Success,
            Some(GuideReply::Ack(ack)) if ack.code == AckCode::Nack => Status::Nack,
            _ => Status::Error,
        }
    }
}
