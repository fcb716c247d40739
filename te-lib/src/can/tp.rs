//! J1939-21 transport protocol: connection-management frames, data-transfer
//! chunking and receive-side reassembly.
//!
//! The kernel J1939 backend gets all of this from the socket layer; the
//! raw-CAN backend drives these pieces itself. Origination (RTS/CTS and BAM
//! pacing) lives in the backend since it needs the socket; this module owns
//! the wire forms and the stateful reassembly of incoming sessions.

use crate::can::pgn::{Pgn, std_pgn};
use std::collections::HashMap;

/// TP.CM control bytes.
pub mod ctrl {
    pub const RTS: u8 = 16;
    pub const CTS: u8 = 17;
    pub const EOM_ACK: u8 = 19;
    pub const BAM: u8 = 32;
    pub const ABORT: u8 = 255;
}

/// Bytes of payload carried by one TP.DT frame.
pub const DT_CHUNK: usize = 7;

/// Most packets a single TP session can describe.
pub const MAX_PACKETS: usize = 255;

/// A TP.CM frame. Field meaning depends on the control byte, so the
/// accessors are layout-aware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmFrame {
    raw: [u8; 8],
}

impl CmFrame {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = data.get(..8)?.try_into().ok()?;
        Some(Self { raw })
    }

    pub fn control(&self) -> u8 {
        self.raw[0]
    }

    /// Total message size (RTS, BAM, EndOfMsgAck).
    pub fn size(&self) -> u16 {
        u16::from_le_bytes([self.raw[1], self.raw[2]])
    }

    /// Total packet count (RTS, BAM, EndOfMsgAck).
    pub fn num_packets(&self) -> u8 {
        self.raw[3]
    }

    /// Packets cleared to send by this CTS.
    pub fn cts_window(&self) -> u8 {
        self.raw[1]
    }

    /// Sequence number the CTS expects next.
    pub fn cts_next_seq(&self) -> u8 {
        self.raw[2]
    }

    /// Parameter group the session carries.
    pub fn pgn(&self) -> Option<Pgn> {
        Pgn::from_bytes(&self.raw[5..8])
    }

    pub fn bam(size: u16, num_packets: u8, pgn: Pgn) -> [u8; 8] {
        let p = pgn.to_bytes();
        let s = size.to_le_bytes();
        [ctrl::BAM, s[0], s[1], num_packets, 0xFF, p[0], p[1], p[2]]
    }

    pub fn rts(size: u16, num_packets: u8, pgn: Pgn) -> [u8; 8] {
        let p = pgn.to_bytes();
        let s = size.to_le_bytes();
        [ctrl::RTS, s[0], s[1], num_packets, 0xFF, p[0], p[1], p[2]]
    }

    pub fn cts(num_packets: u8, next_seq: u8, pgn: Pgn) -> [u8; 8] {
        let p = pgn.to_bytes();
        [ctrl::CTS, num_packets, next_seq, 0xFF, 0xFF, p[0], p[1], p[2]]
    }

    pub fn eom_ack(size: u16, num_packets: u8, pgn: Pgn) -> [u8; 8] {
        let p = pgn.to_bytes();
        let s = size.to_le_bytes();
        [ctrl::EOM_ACK, s[0], s[1], num_packets, 0xFF, p[0], p[1], p[2]]
    }

    pub fn abort(reason: u8, pgn: Pgn) -> [u8; 8] {
        let p = pgn.to_bytes();
        [ctrl::ABORT, reason, 0xFF, 0xFF, 0xFF, p[0], p[1], p[2]]
    }
}

/// Number of TP.DT frames needed for `len` payload bytes.
pub fn packet_count(len: usize) -> usize {
    len.div_ceil(DT_CHUNK)
}

/// Split a payload into numbered TP.DT frames, padded with 0xFF.
pub fn dt_frames(data: &[u8]) -> impl Iterator<Item = [u8; 8]> + '_ {
    data.chunks(DT_CHUNK).enumerate().map(|(i, chunk)| {
        let mut frame = [0xFFu8; 8];
        frame[0] = (i + 1) as u8;
        frame[1..1 + chunk.len()].copy_from_slice(chunk);
        frame
    })
}

/// What the backend should do after feeding a TP frame to the reassembler.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TpOutcome {
    /// TP.CM frame to transmit back to the originator (CTS or EndOfMsgAck).
    pub reply: Option<[u8; 8]>,
    /// A completed incoming message: announced PGN and reassembled payload.
    pub complete: Option<(Pgn, Vec<u8>)>,
}

#[derive(Debug)]
struct RxSession {
    pgn: Pgn,
    size: usize,
    num_packets: u8,
    next_seq: u8,
    data: Vec<u8>,
    /// RTS sessions get flow control and an EndOfMsgAck; BAM sessions don't.
    directed: bool,
}

/// Receive-side reassembly of BAM broadcasts and RTS/CTS sessions directed
/// at this node. One in-flight session per originator address.
#[derive(Debug, Default)]
pub struct Reassembler {
    sessions: HashMap<u8, RxSession>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a TP.CM frame from `src`.
    pub fn handle_cm(&mut self, src: u8, cm: CmFrame) -> TpOutcome {
        let mut outcome = TpOutcome::default();
        let Some(pgn) = cm.pgn() else {
            return outcome;
        };
        match cm.control() {
            ctrl::BAM => {
                self.sessions.insert(
                    src,
                    RxSession {
                        pgn,
                        size: cm.size() as usize,
                        num_packets: cm.num_packets(),
                        next_seq: 1,
                        data: Vec::with_capacity(cm.size() as usize),
                        directed: false,
                    },
                );
            }
            ctrl::RTS => {
                self.sessions.insert(
                    src,
                    RxSession {
                        pgn,
                        size: cm.size() as usize,
                        num_packets: cm.num_packets(),
                        next_seq: 1,
                        data: Vec::with_capacity(cm.size() as usize),
                        directed: true,
                    },
                );
                // Clear the whole session with one CTS window.
                outcome.reply = Some(CmFrame::cts(cm.num_packets(), 1, pgn));
            }
            ctrl::ABORT => {
                self.sessions.remove(&src);
            }
            _ => {}
        }
        outcome
    }

    /// Feed a TP.DT frame from `src`.
    pub fn handle_dt(&mut self, src: u8, data: &[u8]) -> TpOutcome {
        let outcome = TpOutcome::default();
        if data.is_empty() {
            return outcome;
        }
        let Some(session) = self.sessions.get_mut(&src) else {
            return outcome;
        };
        let seq = data[0];
        if seq != session.next_seq {
            // Out-of-sequence data voids the session.
            self.sessions.remove(&src);
            return TpOutcome::default();
        }
        session.next_seq = session.next_seq.wrapping_add(1);
        session.data.extend_from_slice(&data[1..]);

        if seq == session.num_packets {
            let session = self.sessions.remove(&src).expect("session present");
            let mut payload = session.data;
            payload.truncate(session.size);
            let reply = session.directed.then(|| {
                CmFrame::eom_ack(session.size as u16, session.num_packets, session.pgn)
            });
            return TpOutcome {
                reply,
                complete: Some((session.pgn, payload)),
            };
        }
        TpOutcome::default()
    }
}

/// True when `pgn` is TP connection management.
pub fn is_tp_cm(pgn: Pgn) -> bool {
    pgn.pf() == std_pgn::TP_CM.pf()
}

/// True when `pgn` is TP data transfer.
pub fn is_tp_dt(pgn: Pgn) -> bool {
    pgn.pf() == std_pgn::TP_DT.pf()
}
