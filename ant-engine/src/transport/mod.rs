// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Byte level links to a radio.
//!
//! The engine only needs to push bytes out and wait a bounded time for bytes to come back, every
//! adapter here is a thin shim over an existing driver.

mod serial;
#[cfg(feature = "tty")]
mod tty;
#[cfg(feature = "usb")]
mod usb;

pub use serial::*;
#[cfg(feature = "tty")]
pub use tty::*;
#[cfg(feature = "usb")]
pub use usb::*;

use embedded_hal::digital::PinState;
use std::time::Duration;
use thiserror::Error;

/// Baud rate ANT USB sticks use when exposed as a serial device
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport has been closed")]
    Closed,
    #[error("no matching device: {0}")]
    NoDevice(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial line error: {0:?}")]
    Serial(embedded_hal_nb::serial::ErrorKind),
    #[error("sleep pin could not be driven {0:?}")]
    PinChange(PinState),
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
    #[cfg(feature = "usb")]
    #[error("USB setup failed: {0:?}")]
    UsbSetup(UsbError),
    #[cfg(feature = "tty")]
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}

/// A bidirectional byte link shared between the router thread and callers
pub trait Transport: Send + Sync {
    /// Hand `bytes` to the device, returns once all of them are accepted
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
    /// Wait up to `timeout` for inbound bytes. `Ok(0)` means nothing arrived in time.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
    /// Stop using the device, further calls fail with [TransportError::Closed]
    fn close(&self) {}
}
