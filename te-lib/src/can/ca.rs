//! The controller-application abstraction: one claimed source address on one
//! CAN bus, exchanging J1939 messages.

use crate::can::name::Name;
use crate::can::pgn::{Pgn, std_pgn};
use crate::error::Result;
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Broadcast destination address.
pub const GLOBAL_ADDR: u8 = 0xFF;

/// Default J1939 priority used for outgoing frames.
pub const DEFAULT_PRIORITY: u8 = 6;

/// Source of a received message. The session layer correlates on
/// `source_address` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub priority: u8,
    pub pgn: Pgn,
    pub source_address: u8,
}

/// A reassembled J1939 message, stamped at enqueue time with the monotonic
/// clock.
#[derive(Debug, Clone)]
pub struct Message {
    pub address: Address,
    pub data: Bytes,
    pub timestamp: Instant,
}

impl Message {
    pub fn sa(&self) -> u8 {
        self.address.source_address
    }

    pub fn pgn(&self) -> Pgn {
        self.address.pgn
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A device announcing itself during a bus scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressClaim {
    pub name: Name,
    pub source_address: u8,
}

impl AddressClaim {
    pub fn parse(msg: &Message) -> Option<Self> {
        if msg.pgn() != std_pgn::ADDRESS_CLAIMED {
            return None;
        }
        Some(Self {
            name: Name::from_bytes(&msg.data)?,
            source_address: msg.sa(),
        })
    }
}

/// Narrow transport contract the session layer builds on. Two real backends
/// exist ([`Ca`]); tests substitute their own.
pub trait ControllerApp: Send {
    /// Name of the CAN interface this CA is bound to.
    fn interface_name(&self) -> &str;

    /// The CA's own claimed source address.
    fn address(&self) -> u8;

    /// Send `data` to a specific node. Payloads over 8 bytes go through the
    /// J1939 transport protocol; the call resolves once the multi-packet
    /// session completes. Returns the number of bytes sent.
    fn send_to(&mut self, pgn: Pgn, dest: u8, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Broadcast `data` to every node on the bus.
    fn send_globally(&mut self, pgn: Pgn, data: &[u8]) -> impl Future<Output = Result<usize>> + Send {
        self.send_to(pgn, GLOBAL_ADDR, data)
    }

    /// Pop the next received message, waiting up to `timeout`.
    fn recv_msg(&mut self, timeout: Duration) -> impl Future<Output = Option<Message>> + Send;

    /// Release the bus and stop the background receiver.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Request PGN `ADDRESS_CLAIMED` globally and collect the distinct
    /// claims heard before the deadline.
    fn scan_for_devices(&mut self, timeout: Duration) -> impl Future<Output = Result<Vec<AddressClaim>>> + Send {
        async move {
            self.send_globally(std_pgn::PGN_REQUEST, &std_pgn::ADDRESS_CLAIMED.to_bytes())
                .await?;

            let deadline = Instant::now() + timeout;
            let mut seen: HashSet<u8> = HashSet::new();
            let mut claims = Vec::new();
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let Some(msg) = self.recv_msg(deadline - now).await else {
                    continue;
                };
                let Some(claim) = AddressClaim::parse(&msg) else {
                    trace!("scan: ignoring {} from {:#04x}", msg.pgn(), msg.sa());
                    continue;
                };
                if seen.insert(claim.source_address) {
                    claims.push(claim);
                }
            }
            Ok(claims)
        }
    }
}

/// The closed set of real CA backends, so sessions and discovery can hold a
/// single concrete transport type.
pub enum Ca {
    /// Kernel `CAN_J1939` datagram socket.
    Kernel(crate::can::kernel::KernelCa),
    /// Raw CAN frames plus the in-crate transport-protocol engine.
    Universal(crate::can::universal::UniversalCa),
}

impl ControllerApp for Ca {
    fn interface_name(&self) -> &str {
        match self {
            Ca::Kernel(ca) => ca.interface_name(),
            Ca::Universal(ca) => ca.interface_name(),
        }
    }

    fn address(&self) -> u8 {
        match self {
            Ca::Kernel(ca) => ca.address(),
            Ca::Universal(ca) => ca.address(),
        }
    }

    async fn send_to(&mut self, pgn: Pgn, dest: u8, data: &[u8]) -> Result<usize> {
        match self {
            Ca::Kernel(ca) => ca.send_to(pgn, dest, data).await,
            Ca::Universal(ca) => ca.send_to(pgn, dest, data).await,
        }
    }

    async fn recv_msg(&mut self, timeout: Duration) -> Option<Message> {
        match self {
            Ca::Kernel(ca) => ca.recv_msg(timeout).await,
            Ca::Universal(ca) => ca.recv_msg(timeout).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Ca::Kernel(ca) => ca.disconnect().await,
            Ca::Universal(ca) => ca.disconnect().await,
        }
    }
}

/// Shared receive-side plumbing: pop from the FIFO with a deadline.
pub(crate) async fn pop_with_timeout(
    rx: &mut tokio::sync::mpsc::Receiver<Message>,
    timeout: Duration,
) -> Option<Message> {
    if timeout.is_zero() {
        return rx.try_recv().ok();
    }
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}
