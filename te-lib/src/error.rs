use std::io;
use thiserror::Error;

/// The primary error type for the `te-lib` library.
///
/// Protocol-level outcomes (NACK, access denied, timeouts while waiting for
/// a response) are reported through [`crate::types::Status`]; `TeError` covers
/// hard faults: transport I/O, malformed wire data, missing devices.
#[derive(Error, Debug)]
pub enum TeError {
    #[error("device not found. Is the Touch Encoder connected?")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("CAN error: {0}")]
    Can(#[from] socketcan::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout during transport operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no response from device")]
    NoResponse,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("payload of {0} bytes is too large for a context-sensitive report")]
    PayloadTooLarge(usize),

    #[error("unsupported package file: {0}")]
    UnsupportedPackage(String),

    #[error("transport is disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, TeError>;
