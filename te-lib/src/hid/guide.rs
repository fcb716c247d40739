//! GUIDE screen/variable operations over the HID widget channel.

use crate::constants::{MAX_REPORT_SIZE, RESPONSE_TIMEOUT};
use crate::error::{Result, TeError};
use crate::guide::guide_cmd;
use crate::hid::HidTouchEncoder;
use crate::hid::reports::{GuideErrorReport, ScreenReport, VariableReport};
use crate::hid::transport::HidIo;
use crate::types::{ScreenId, Status, VariableData, VariableId};
use tracing::warn;

enum GuideReply<R> {
    Report(R),
    Refused(GuideErrorReport),
}

impl<T: HidIo> HidTouchEncoder<T> {
    /// ID of the screen currently shown, read as an input report: the
    /// device answers `[SCREEN][id]` without any command traffic.
    pub async fn get_screen(&mut self) -> Result<ScreenId> {
        let raw = self.transport.get_input_report(guide_cmd::SCREEN, 2).await?;
        ScreenReport::parse_raw(&raw)
            .map(|report| report.screen_id)
            .ok_or(TeError::NoResponse)
    }

    /// Switch the device to `screen_id`. Success is the echoed screen
    /// report; a GUIDE error naming the screen report means refusal.
    pub async fn set_screen(&mut self, screen_id: ScreenId) -> Status {
        if let Err(e) = self
            .send_widget_command(&[guide_cmd::SCREEN, screen_id.value()])
            .await
        {
            warn!("set screen failed: {e}");
            return Status::Error;
        }
        let reply = self
            .await_response(RESPONSE_TIMEOUT, None, |f| {
                GuideErrorReport::parse(f)
                    .map(GuideReply::Refused)
                    .or_else(|| ScreenReport::parse(f).map(GuideReply::Report))
            })
            .await;
        match reply {
            Some(GuideReply::Refused(err)) if err.failed_report_id == guide_cmd::SCREEN => {
                Status::Nack
            }
            Some(GuideReply::Report(report)) if report.screen_id == screen_id => Status::Success,
            _ => Status::Error,
        }
    }

    /// Read a variable's value: a widget-channel request followed by a
    /// sized input report.
    pub async fn get_var(
        &mut self,
        screen_id: ScreenId,
        variable_id: VariableId,
    ) -> Result<VariableData> {
        self.send_widget_command(&[
            guide_cmd::VARIABLE,
            screen_id.value(),
            variable_id.value(),
            0x00,
            0x00,
        ])
        .await?;
        let raw = self
            .transport
            .get_input_report(guide_cmd::VARIABLE, MAX_REPORT_SIZE)
            .await?;
        VariableReport::parse_raw(&raw)
            .map(|report| report.value)
            .ok_or(TeError::NoResponse)
    }

    /// Write a variable: `[VARIABLE][screen][var][len:2 LE][value]` on the
    /// widget channel. Success is an echoed variable report for the same
    /// `(screen, variable)` pair.
    pub async fn set_var(
        &mut self,
        screen_id: ScreenId,
        variable_id: VariableId,
        data: &VariableData,
    ) -> Status {
        let value = data.as_bytes();
        let mut command = Vec::with_capacity(5 + value.len());
        command.extend_from_slice(&[guide_cmd::VARIABLE, screen_id.value(), variable_id.value()]);
        command.extend_from_slice(&(value.len() as u16).to_le_bytes());
        command.extend_from_slice(value);
        if let Err(e) = self.send_widget_command(&command).await {
            warn!("set variable failed: {e}");
            return Status::Error;
        }
        let reply = self
            .await_response(RESPONSE_TIMEOUT, None, |f| {
                GuideErrorReport::parse(f)
                    .map(GuideReply::Refused)
                    .or_else(|| VariableReport::parse(f).map(GuideReply::Report))
            })
            .await;
        match reply {
            Some(GuideReply::Refused(err)) if err.failed_report_id == guide_cmd::VARIABLE => {
                Status::Nack
            }
            Some(GuideReply::Report(report))
                if report.screen_id == screen_id && report.variable_id == variable_id =>
            {
                Status::Success
            }
            _ => Status::Error,
        }
    }
}
