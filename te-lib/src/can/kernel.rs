//! Controller application over the kernel's native `CAN_J1939` socket
//! family. The kernel owns address claiming, destination filtering and the
//! transport protocol; this backend is a thin datagram wrapper with the
//! common background-receiver shape.

use crate::can::ca::{Address, ControllerApp, DEFAULT_PRIORITY, GLOBAL_ADDR, Message, pop_with_timeout};
use crate::can::pgn::Pgn;
use crate::constants::J1939_MTU;
use crate::error::{Result, TeError};
use bytes::Bytes;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

pub struct KernelCa {
    interface: String,
    address: u8,
    fd: Arc<AsyncFd<OwnedFd>>,
    rx: mpsc::Receiver<Message>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

fn j1939_sockaddr(ifindex: libc::c_int, name: u64, pgn: u32, addr: u8) -> libc::sockaddr_can {
    let mut sockaddr: libc::sockaddr_can = unsafe { mem::zeroed() };
    sockaddr.can_family = libc::AF_CAN as libc::sa_family_t;
    sockaddr.can_ifindex = ifindex;
    sockaddr.can_addr.j1939.name = name;
    sockaddr.can_addr.j1939.pgn = pgn;
    sockaddr.can_addr.j1939.addr = addr;
    sockaddr
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, u32, u8)> {
    let mut src: libc::sockaddr_can = unsafe { mem::zeroed() };
    let mut src_len = mem::size_of::<libc::sockaddr_can>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut src as *mut _ as *mut libc::sockaddr,
            &mut src_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let (pgn, addr) = unsafe { (src.can_addr.j1939.pgn, src.can_addr.j1939.addr) };
    Ok((n as usize, pgn, addr))
}

fn send_raw(fd: RawFd, data: &[u8], dest: &libc::sockaddr_can) -> io::Result<usize> {
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            dest as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl KernelCa {
    /// Bind a J1939 socket to `(interface, NO_NAME, NO_PGN, address)`.
    /// Fails with the OS error when the kernel lacks the J1939 family,
    /// letting discovery fall back to the raw-CAN backend.
    pub fn new(interface: &str, address: u8) -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::CAN_J1939,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let broadcast: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BROADCAST,
                &broadcast as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let ifname = CString::new(interface)
            .map_err(|_| TeError::Protocol(format!("bad interface name {interface:?}")))?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error().into());
        }

        let bind_addr = j1939_sockaddr(
            ifindex as libc::c_int,
            libc::J1939_NO_NAME,
            libc::J1939_NO_PGN,
            address,
        );
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &bind_addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let fd = Arc::new(AsyncFd::new(fd)?);
        let (tx, rx) = mpsc::channel(256);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(recv_loop(Arc::clone(&fd), tx, stop_rx));

        debug!("{interface}: bound J1939 socket at address {address:#04x}");
        Ok(Self {
            interface: interface.to_string(),
            address,
            fd,
            rx,
            stop,
            task: Some(task),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    async fn send(&self, data: &[u8], dest: libc::sockaddr_can) -> Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_raw(inner.get_ref().as_raw_fd(), data, &dest)) {
                Ok(result) => return result.map_err(Into::into),
                Err(_would_block) => continue,
            }
        }
    }
}

impl ControllerApp for KernelCa {
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
        // PDU1 destinations ride in the sockaddr, not the PGN's PS byte.
        let (pgn_field, addr_field) = if dest == GLOBAL_ADDR {
            (pgn.value(), libc::J1939_NO_ADDR)
        } else if pgn.is_pdu1() {
            (pgn.value() & !0xFF, dest)
        } else {
            (pgn.value(), dest)
        };
        let dest_addr = j1939_sockaddr(0, libc::J1939_NO_NAME, pgn_field, addr_field);
        self.send(data, dest_addr).await
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

async fn recv_loop(
    fd: Arc<AsyncFd<OwnedFd>>,
    tx: mpsc::Sender<Message>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; J1939_MTU];
    'outer: loop {
        let readable = tokio::select! {
            _ = stop.changed() => break,
            readable = fd.readable() => readable,
        };
        let mut guard = match readable {
            Ok(guard) => guard,
            Err(e) => {
                error!("J1939 socket poll failed: {e}");
                break;
            }
        };
        loop {
            match guard.try_io(|inner| recv_raw(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok((n, pgn, sa))) => {
                    let msg = Message {
                        address: Address {
                            priority: DEFAULT_PRIORITY,
                            pgn: Pgn::new(pgn & crate::can::pgn::PGN_MASK),
                            source_address: sa,
                        },
                        data: Bytes::copy_from_slice(&buf[..n]),
                        timestamp: Instant::now(),
                    };
                    trace!("recv {} <- {:#04x} [{}]", msg.pgn(), sa, n);
                    if tx.send(msg).await.is_err() {
                        break 'outer;
                    }
                }
                Ok(Err(e)) => {
                    error!("J1939 receive failed: {e}");
                    break 'outer;
                }
                Err(_would_block) => break,
            }
        }
    }
    debug!("J1939 receiver stopped");
}
