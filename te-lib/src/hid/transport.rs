//! USB transport for HID Touch Encoders, built on nusb.
//!
//! The device exposes two HID interfaces: interface 0 carries the command
//! channel plus the version feature reports and the firmware-upload writes,
//! interface 1 is the widget/GUIDE channel (absent while the utility app is
//! running). A single background task reads both interrupt IN endpoints and
//! feeds one bounded FIFO; feature and input reports go through HID class
//! control transfers.

use crate::constants::MAX_REPORT_SIZE;
use crate::error::{Result, TeError};
use crate::hid::reports::ReportFrame;
use bytes::Bytes;
use futures_lite::StreamExt;
use nusb::descriptors::TransferType;
use nusb::hotplug::HotplugEvent;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Direction, Interrupt, Recipient};
use nusb::{Device, DeviceInfo, Interface};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, error, info, trace, warn};

/// Grayhill vendor ID.
pub const VENDOR_ID: u16 = 0x1658;
/// Touch Encoder product ID.
pub const PRODUCT_ID: u16 = 0x0060;

/// Command channel interface (also sw-ver feature reports and update writes).
const CMD_INTERFACE: u8 = 0;
/// Widget/GUIDE channel interface.
const WIDGET_INTERFACE: u8 = 1;

/// Timeout for individual USB operations.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Enumeration poll period used when hot-plug events are unavailable.
const ENUM_POLL_PERIOD: Duration = Duration::from_millis(500);

/// HID class requests.
const HID_GET_REPORT: u8 = 0x01;
const HID_SET_REPORT: u8 = 0x09;
const REPORT_TYPE_INPUT: u16 = 0x0100;
const REPORT_TYPE_OUTPUT: u16 = 0x0200;
const REPORT_TYPE_FEATURE: u16 = 0x0300;

/// Logical channels a caller can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidEndpoint {
    Cmd,
    Widget,
}

/// Transport seam the HID session drives; implemented by [`UsbHidTransport`]
/// and by test fakes.
pub trait HidIo: Send {
    fn serial(&self) -> &str;

    /// False while the device runs the utility app (no widget interface).
    fn has_widget(&self) -> bool;

    /// Write a report to the given channel, returning the bytes written.
    /// Writes to an absent widget channel return 0 without touching the bus.
    fn send(&mut self, endpoint: HidEndpoint, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Read a feature report from the command interface.
    fn get_feature_report(&mut self, report_id: u8, len: usize) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Read an input report from the widget interface; empty when absent.
    fn get_input_report(&mut self, report_id: u8, len: usize) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Write a firmware-upload payload to the update channel.
    fn send_update_payload(&mut self, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Pop the next received report, waiting up to `timeout`.
    fn recv_report(&mut self, timeout: Duration) -> impl Future<Output = Option<ReportFrame>> + Send;

    /// Stop the receiver and release the device.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Re-enumerate by VID/PID, match by serial number, and reopen.
    fn reconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

pub struct UsbHidTransport {
    serial: String,
    #[allow(dead_code)]
    device: Device,
    cmd: Interface,
    widget: Option<Interface>,
    cmd_writer: EndpointWrite<Interrupt>,
    widget_writer: Option<EndpointWrite<Interrupt>>,
    rx: mpsc::Receiver<ReportFrame>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// First interrupt IN/OUT endpoint addresses of an interface's default
/// alternate setting.
fn interrupt_endpoints(interface: &Interface) -> (Option<u8>, Option<u8>) {
    let mut ep_in = None;
    let mut ep_out = None;
    if let Some(descriptor) = interface.descriptors().next() {
        for endpoint in descriptor.endpoints() {
            if endpoint.transfer_type() != TransferType::Interrupt {
                continue;
            }
            match endpoint.direction() {
                Direction::In if ep_in.is_none() => ep_in = Some(endpoint.address()),
                Direction::Out if ep_out.is_none() => ep_out = Some(endpoint.address()),
                _ => {}
            }
        }
    }
    (ep_in, ep_out)
}

fn matches_serial(info: &DeviceInfo, serial: &str) -> bool {
    info.vendor_id() == VENDOR_ID
        && info.product_id() == PRODUCT_ID
        && (serial.is_empty() || info.serial_number() == Some(serial))
}

impl UsbHidTransport {
    /// Open the Touch Encoder matching `serial` (any Touch Encoder when
    /// empty) and start the background receiver.
    pub async fn open(serial: &str) -> Result<Self> {
        let info = nusb::list_devices()
            .await?
            .find(|d| matches_serial(d, serial))
            .ok_or(TeError::DeviceNotFound)?;
        Self::open_from(&info).await
    }

    /// Open a specific enumerated device.
    pub async fn open_from(info: &DeviceInfo) -> Result<Self> {
        let serial = info.serial_number().unwrap_or_default().to_string();
        let device = info.open().await?;

        // Both interfaces carry kernel HID drivers on Linux.
        for interface in [CMD_INTERFACE, WIDGET_INTERFACE] {
            if let Err(e) = device.detach_kernel_driver(interface) {
                trace!("could not detach interface {interface}: {e}");
            }
        }

        let cmd = device.claim_interface(CMD_INTERFACE).await?;
        // The widget interface disappears while the utility app runs.
        let widget = match device.claim_interface(WIDGET_INTERFACE).await {
            Ok(interface) => Some(interface),
            Err(e) => {
                debug!("no widget interface (utility app?): {e}");
                None
            }
        };

        let (cmd_in, cmd_out) = interrupt_endpoints(&cmd);
        let cmd_in = cmd_in.ok_or_else(|| {
            TeError::Protocol("command interface has no interrupt IN endpoint".into())
        })?;
        let cmd_out = cmd_out.ok_or_else(|| {
            TeError::Protocol("command interface has no interrupt OUT endpoint".into())
        })?;

        let cmd_reader = cmd
            .endpoint::<Interrupt, _>(cmd_in)
            .map_err(|e| TeError::Protocol(format!("claim endpoint {cmd_in:#04x}: {e}")))?
            .reader(MAX_REPORT_SIZE)
            .with_num_transfers(4);
        let cmd_writer = cmd
            .endpoint::<Interrupt, _>(cmd_out)
            .map_err(|e| TeError::Protocol(format!("claim endpoint {cmd_out:#04x}: {e}")))?
            .writer(MAX_REPORT_SIZE)
            .with_num_transfers(4);

        let mut widget_reader = None;
        let mut widget_writer = None;
        if let Some(widget) = &widget {
            let (widget_in, widget_out) = interrupt_endpoints(widget);
            if let Some(address) = widget_in {
                widget_reader = Some(
                    widget
                        .endpoint::<Interrupt, _>(address)
                        .map_err(|e| TeError::Protocol(format!("claim endpoint {address:#04x}: {e}")))?
                        .reader(MAX_REPORT_SIZE)
                        .with_num_transfers(4),
                );
            }
            if let Some(address) = widget_out {
                widget_writer = Some(
                    widget
                        .endpoint::<Interrupt, _>(address)
                        .map_err(|e| TeError::Protocol(format!("claim endpoint {address:#04x}: {e}")))?
                        .writer(MAX_REPORT_SIZE)
                        .with_num_transfers(4),
                );
            }
        }

        let (tx, rx) = mpsc::channel(256);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(recv_loop(cmd_reader, widget_reader, tx, stop_rx));

        info!("usb:{serial}: connected (widget {})", widget.is_some());
        Ok(Self {
            serial,
            device,
            cmd,
            widget,
            cmd_writer,
            widget_writer,
            rx,
            stop,
            task: Some(task),
        })
    }

    async fn write_interrupt(writer: &mut EndpointWrite<Interrupt>, data: &[u8]) -> Result<usize> {
        timeout(IO_TIMEOUT, writer.write_all(data)).await??;
        timeout(IO_TIMEOUT, writer.flush_end_async()).await??;
        Ok(data.len())
    }
}

impl HidIo for UsbHidTransport {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn has_widget(&self) -> bool {
        self.widget.is_some()
    }

    async fn send(&mut self, endpoint: HidEndpoint, data: &[u8]) -> Result<usize> {
        trace!("send {endpoint:?} [{}] {:02x?}", data.len(), data);
        match endpoint {
            HidEndpoint::Cmd => Self::write_interrupt(&mut self.cmd_writer, data).await,
            HidEndpoint::Widget => match (&mut self.widget_writer, &self.widget) {
                (Some(writer), _) => Self::write_interrupt(writer, data).await,
                (None, Some(widget)) => {
                    // No OUT endpoint: fall back to a SET_REPORT transfer.
                    let report_id = data.first().copied().unwrap_or(0);
                    timeout(
                        IO_TIMEOUT,
                        widget.control_out(
                            ControlOut {
                                control_type: ControlType::Class,
                                recipient: Recipient::Interface,
                                request: HID_SET_REPORT,
                                value: REPORT_TYPE_OUTPUT | report_id as u16,
                                index: WIDGET_INTERFACE as u16,
                                data,
                            },
                            IO_TIMEOUT,
                        ),
                    )
                    .await??;
                    Ok(data.len())
                }
                (None, None) => Ok(0),
            },
        }
    }

    async fn get_feature_report(&mut self, report_id: u8, len: usize) -> Result<Vec<u8>> {
        let data = timeout(
            IO_TIMEOUT,
            self.cmd.control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_GET_REPORT,
                    value: REPORT_TYPE_FEATURE | report_id as u16,
                    index: CMD_INTERFACE as u16,
                    length: len as u16,
                },
                IO_TIMEOUT,
            ),
        )
        .await??;
        trace!("feature report {report_id} [{}] {:02x?}", data.len(), data);
        Ok(data)
    }

    async fn get_input_report(&mut self, report_id: u8, len: usize) -> Result<Vec<u8>> {
        let Some(widget) = &self.widget else {
            return Ok(Vec::new());
        };
        let data = timeout(
            IO_TIMEOUT,
            widget.control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_GET_REPORT,
                    value: REPORT_TYPE_INPUT | report_id as u16,
                    index: WIDGET_INTERFACE as u16,
                    length: len as u16,
                },
                IO_TIMEOUT,
            ),
        )
        .await??;
        trace!("input report {report_id} [{}] {:02x?}", data.len(), data);
        Ok(data)
    }

    async fn send_update_payload(&mut self, data: &[u8]) -> Result<usize> {
        Self::write_interrupt(&mut self.cmd_writer, data).await
    }

    async fn recv_report(&mut self, timeout: Duration) -> Option<ReportFrame> {
        if timeout.is_zero() {
            return self.rx.try_recv().ok();
        }
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    async fn disconnect(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("usb:{}: disconnected", self.serial);
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await;
        let fresh = Self::open(&self.serial).await?;
        *self = fresh;
        Ok(())
    }
}

async fn recv_loop(
    mut cmd_reader: EndpointRead<Interrupt>,
    mut widget_reader: Option<EndpointRead<Interrupt>>,
    tx: mpsc::Sender<ReportFrame>,
    mut stop: watch::Receiver<bool>,
) {
    let mut cmd_buf = vec![0u8; MAX_REPORT_SIZE];
    let mut widget_buf = vec![0u8; MAX_REPORT_SIZE];
    loop {
        let (buf, read) = tokio::select! {
            _ = stop.changed() => break,
            read = cmd_reader.read(&mut cmd_buf) => (&cmd_buf, read),
            read = async {
                match widget_reader.as_mut() {
                    Some(reader) => reader.read(&mut widget_buf).await,
                    None => std::future::pending().await,
                }
            } => (&widget_buf, read),
        };
        match read {
            Ok(0) => continue,
            Ok(n) => {
                let frame = ReportFrame::new(Bytes::copy_from_slice(&buf[..n]), Instant::now());
                trace!("recv report {:#04x} [{n}]", frame.report_id());
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("device disconnected: {e}");
                break;
            }
        }
    }
    debug!("HID receiver stopped");
}

/// Wait for a Touch Encoder with `serial` to (re)appear, first via hot-plug
/// arrival events, falling back to periodic enumeration. Returns whether the
/// device showed up before the deadline.
pub async fn wait_for_arrival(serial: &str, deadline: Instant) -> bool {
    match nusb::watch_devices() {
        Ok(mut watch) => loop {
            match timeout_at(deadline, watch.next()).await {
                Ok(Some(HotplugEvent::Connected(info))) if matches_serial(&info, serial) => {
                    debug!("hotplug arrival for usb:{serial}");
                    return true;
                }
                Ok(Some(_)) => continue,
                Ok(None) => return false,
                Err(_) => return false,
            }
        },
        Err(e) => {
            warn!("hotplug watch unavailable ({e}); polling enumeration");
            loop {
                if Instant::now() >= deadline {
                    return false;
                }
                sleep(ENUM_POLL_PERIOD).await;
                match nusb::list_devices().await {
                    Ok(mut devices) => {
                        if devices.any(|d| matches_serial(&d, serial)) {
                            return true;
                        }
                    }
                    Err(e) => warn!("enumeration failed: {e}"),
                }
            }
        }
    }
}
