//! Controller application over raw CAN frames.
//!
//! Used when the kernel has no `CAN_J1939` family. Address claiming, the
//! transport protocol and destination filtering all run in-process here; the
//! receive task reassembles incoming TP sessions and routes TP flow-control
//! frames destined for us to the originating `send_to` call.

use crate::can::ca::{Address, ControllerApp, DEFAULT_PRIORITY, GLOBAL_ADDR, Message, pop_with_timeout};
use crate::can::name::Name;
use crate::can::pgn::{PGN_MASK, Pgn, std_pgn};
use crate::can::tp::{self, CmFrame, Reassembler, ctrl};
use crate::constants::J1939_MTU;
use crate::error::{Result, TeError};
use bytes::Bytes;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, trace, warn};

/// Time allowed for a full multi-packet transmission.
const TP_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between broadcast TP.DT frames.
const BAM_DT_INTERVAL: Duration = Duration::from_millis(50);

/// Socket send buffer, sized to one MTU as the kernel backend does.
const SEND_BUF_SIZE: usize = J1939_MTU;

/// Default NAME announced by the host-side CA.
const HOST_NAME: Name = Name::from_fields(1_234_567, 666, 1, 1, 1, 1, 1, 5, 0);

/// TP flow-control frame addressed to this CA, forwarded out of the receive
/// task to the in-flight `send_to`.
#[derive(Debug, Clone, Copy)]
struct TpControl {
    src: u8,
    cm: CmFrame,
}

pub struct UniversalCa {
    interface: String,
    address: u8,
    socket: Arc<CanSocket>,
    rx: mpsc::Receiver<Message>,
    tp_ctrl_rx: mpsc::Receiver<TpControl>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Pack a 29-bit J1939 CAN identifier. PDU1 groups carry the destination in
/// their PS byte.
fn pack_id(priority: u8, pgn: Pgn, dest: u8, sa: u8) -> u32 {
    let mut group = pgn.value() & PGN_MASK;
    if pgn.is_pdu1() {
        group = (group & !0xFF) | dest as u32;
    }
    ((priority as u32 & 0x7) << 26) | (group << 8) | sa as u32
}

/// Unpack a 29-bit identifier into priority, masked PGN, destination and
/// source. PDU2 frames are implicitly global.
fn unpack_id(id: u32) -> (u8, Pgn, u8, u8) {
    let sa = (id & 0xFF) as u8;
    let raw = (id >> 8) & PGN_MASK;
    let priority = ((id >> 26) & 0x7) as u8;
    let pf = ((raw >> 8) & 0xFF) as u8;
    if pf < crate::can::pgn::PF_PDU2_MIN {
        (priority, Pgn::new(raw & !0xFF), (raw & 0xFF) as u8, sa)
    } else {
        (priority, Pgn::new(raw), GLOBAL_ADDR, sa)
    }
}

fn data_frame(id: u32, data: &[u8]) -> Result<CanFrame> {
    let eid = ExtendedId::new(id)
        .ok_or_else(|| TeError::Protocol(format!("CAN id {id:#X} out of range")))?;
    CanFrame::new(eid, data)
        .ok_or_else(|| TeError::Protocol(format!("frame payload of {} bytes", data.len())))
}

impl UniversalCa {
    /// Open `interface` and claim `address` on it.
    pub async fn new(interface: &str, address: u8) -> Result<Self> {
        let socket = CanSocket::open(interface)?;
        // Match the kernel backend's send buffering.
        unsafe {
            let size = SEND_BUF_SIZE as libc::c_int;
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(256);
        let (tp_ctrl_tx, tp_ctrl_rx) = mpsc::channel(16);
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            address,
            tx,
            tp_ctrl_tx,
            stop_rx,
        ));

        let ca = Self {
            interface: interface.to_string(),
            address,
            socket,
            rx,
            tp_ctrl_rx,
            stop,
            task: Some(task),
        };
        ca.claim_address().await?;
        Ok(ca)
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Announce our NAME on the bus. Contention is not arbitrated; the host
    /// addresses are reserved for scanning CAs by convention.
    async fn claim_address(&self) -> Result<()> {
        let id = pack_id(DEFAULT_PRIORITY, std_pgn::ADDRESS_CLAIMED, GLOBAL_ADDR, self.address);
        let frame = data_frame(id, &HOST_NAME.to_bytes())?;
        self.socket.write_frame(frame).await?;
        debug!("{}: claimed address {:#04x}", self.interface, self.address);
        Ok(())
    }

    async fn write(&self, pgn: Pgn, dest: u8, data: &[u8]) -> Result<()> {
        let id = pack_id(DEFAULT_PRIORITY, pgn, dest, self.address);
        self.socket.write_frame(data_frame(id, data)?).await?;
        Ok(())
    }

    /// Drive one outgoing transport-protocol session to completion.
    async fn send_multipacket(&mut self, pgn: Pgn, dest: u8, data: &[u8]) -> Result<usize> {
        let packets = tp::packet_count(data.len());
        if packets > tp::MAX_PACKETS {
            return Err(TeError::Protocol(format!(
                "payload of {} bytes exceeds one TP session",
                data.len()
            )));
        }
        let num = packets as u8;
        let size = data.len() as u16;

        if dest == GLOBAL_ADDR {
            // Broadcast announce, then paced data frames. No flow control.
            self.write(std_pgn::TP_CM, GLOBAL_ADDR, &CmFrame::bam(size, num, pgn)).await?;
            for frame in tp::dt_frames(data) {
                sleep(BAM_DT_INTERVAL).await;
                self.write(std_pgn::TP_DT, GLOBAL_ADDR, &frame).await?;
            }
            return Ok(data.len());
        }

        // Drain flow-control frames left over from an earlier session.
        while self.tp_ctrl_rx.try_recv().is_ok() {}

        self.write(std_pgn::TP_CM, dest, &CmFrame::rts(size, num, pgn)).await?;

        let frames: Vec<[u8; 8]> = tp::dt_frames(data).collect();
        let mut next: usize = 0;
        while next < frames.len() {
            let Some(ctl) = self.tp_ctrl_rx.recv().await else {
                return Err(TeError::Disconnected);
            };
            if ctl.src != dest {
                continue;
            }
            match ctl.cm.control() {
                ctrl::CTS => {
                    let first = (ctl.cm.cts_next_seq() as usize).saturating_sub(1);
                    let window =
                        (ctl.cm.cts_window() as usize).min(frames.len().saturating_sub(first));
                    for frame in &frames[first..first + window] {
                        self.write(std_pgn::TP_DT, dest, frame).await?;
                    }
                    next = first + window;
                }
                ctrl::ABORT => {
                    warn!("{}: TP session to {dest:#04x} aborted", self.interface);
                    return Ok(0);
                }
                _ => {}
            }
        }

        // Wait for the end-of-message acknowledgement.
        loop {
            let Some(ctl) = self.tp_ctrl_rx.recv().await else {
                return Err(TeError::Disconnected);
            };
            if ctl.src != dest {
                continue;
            }
            match ctl.cm.control() {
                ctrl::EOM_ACK => return Ok(data.len()),
                ctrl::ABORT => {
                    warn!("{}: TP session to {dest:#04x} aborted at EOM", self.interface);
                    return Ok(0);
                }
                _ => {}
            }
        }
    }
}

impl ControllerApp for UniversalCa {
    fn interface_name(&self) -> &str {
        &self.interface
    }

    fn address(&self) -> u8 {
        self.address
    }

    async fn send_to(&mut self, pgn: Pgn, dest: u8, data: &[u8]) -> Result<usize> {
        trace!(
            "{} send {} -> {dest:#04x} [{}] {:02x?}",
            self.interface,
            pgn,
            data.len(),
            data
        );
        if data.len() <= 8 {
            self.write(pgn, dest, data).await?;
            return Ok(data.len());
        }
        if data.len() > J1939_MTU {
            return Err(TeError::Protocol(format!(
                "payload of {} bytes exceeds the J1939 MTU",
                data.len()
            )));
        }
        match timeout(TP_SEND_TIMEOUT, self.send_multipacket(pgn, dest, data)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{}: multi-packet send to {dest:#04x} timed out", self.interface);
                Ok(0)
            }
        }
    }

    async fn recv_msg(&mut self, timeout: Duration) -> Option<Message> {
        pop_with_timeout(&mut self.rx, timeout).await
    }

    async fn disconnect(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Background receiver: parses frames, reassembles TP, routes flow control,
/// and enqueues complete messages stamped with the monotonic clock.
async fn recv_loop(
    socket: Arc<CanSocket>,
    own_address: u8,
    tx: mpsc::Sender<Message>,
    tp_ctrl_tx: mpsc::Sender<TpControl>,
    mut stop: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::new();

    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = socket.read_frame() => frame,
        };
        let frame = match frame {
            Ok(CanFrame::Data(frame)) => frame,
            Ok(_) => continue,
            Err(e) => {
                error!("CAN receive failed: {e}");
                break;
            }
        };
        let raw_id = match frame.id() {
            socketcan::Id::Extended(id) => id.as_raw(),
            socketcan::Id::Standard(_) => continue,
        };
        let (priority, pgn, dest, sa) = unpack_id(raw_id);
        if sa == own_address {
            continue; // our own transmissions echoed back
        }
        if dest != own_address && dest != GLOBAL_ADDR {
            continue;
        }
        let data = frame.data();

        if tp::is_tp_cm(pgn) {
            let Some(cm) = CmFrame::parse(data) else {
                continue;
            };
            match cm.control() {
                ctrl::CTS | ctrl::EOM_ACK if dest == own_address => {
                    let _ = tp_ctrl_tx.try_send(TpControl { src: sa, cm });
                }
                ctrl::ABORT if dest == own_address => {
                    // Could belong to either direction; tell both sides.
                    let _ = tp_ctrl_tx.try_send(TpControl { src: sa, cm });
                    let _ = reassembler.handle_cm(sa, cm);
                }
                _ => {
                    let outcome = reassembler.handle_cm(sa, cm);
                    if let Some(reply) = outcome.reply {
                        send_tp_reply(&socket, sa, own_address, &reply).await;
                    }
                }
            }
            continue;
        }

        if tp::is_tp_dt(pgn) {
            let outcome = reassembler.handle_dt(sa, data);
            if let Some(reply) = outcome.reply {
                send_tp_reply(&socket, sa, own_address, &reply).await;
            }
            if let Some((msg_pgn, payload)) = outcome.complete {
                let msg = Message {
                    address: Address {
                        priority,
                        pgn: msg_pgn,
                        source_address: sa,
                    },
                    data: Bytes::from(payload),
                    timestamp: Instant::now(),
                };
                trace!("recv (tp) {} [{}]", msg.pgn(), msg.len());
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            continue;
        }

        let msg = Message {
            address: Address {
                priority,
                pgn,
                source_address: sa,
            },
            data: Bytes::copy_from_slice(data),
            timestamp: Instant::now(),
        };
        trace!("recv {} <- {:#04x} [{}] {:02x?}", msg.pgn(), sa, msg.len(), &msg.data[..]);
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    debug!("CAN receiver stopped");
}

async fn send_tp_reply(socket: &CanSocket, dest: u8, own_address: u8, reply: &[u8; 8]) {
    let id = pack_id(DEFAULT_PRIORITY, std_pgn::TP_CM, dest, own_address);
    match data_frame(id, reply) {
        Ok(frame) => {
            if let Err(e) = socket.write_frame(frame).await {
                warn!("failed to send TP reply: {e}");
            }
        }
        Err(e) => warn!("failed to build TP reply: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::pgn::te_pgn;

    #[test]
    fn id_round_trip_pdu1() {
        let id = pack_id(6, std_pgn::ACKNOWLEDGEMENT, 0x21, 0x80);
        assert_eq!(id, 0x18E8_2180);
        let (priority, pgn, dest, sa) = unpack_id(id);
        assert_eq!(priority, 6);
        assert_eq!(pgn, std_pgn::ACKNOWLEDGEMENT);
        assert_eq!(dest, 0x21);
        assert_eq!(sa, 0x80);
    }

    #[test]
    fn id_round_trip_pdu2() {
        let id = pack_id(6, te_pgn::GUIDE, 0x21, 0x80);
        let (_, pgn, dest, sa) = unpack_id(id);
        assert_eq!(pgn, te_pgn::GUIDE);
        assert_eq!(dest, GLOBAL_ADDR); // PDU2 is implicitly broadcast
        assert_eq!(sa, 0x80);
    }
}
