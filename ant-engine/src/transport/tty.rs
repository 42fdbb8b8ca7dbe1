// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::transport::{Transport, TransportError};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Transport over an OS serial device, e.g. `/dev/ttyUSB0` for an ANT stick on Linux.
///
/// Reader and writer are separate handles so the router thread can block in a read while callers
/// keep writing.
pub struct TtyTransport {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    closed: AtomicBool,
}

impl TtyTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let writer = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        let reader = writer.try_clone()?;
        debug!(path, baud_rate, "opened serial device");
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Transport for TtyTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let mut port = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_open()?;
        let mut port = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
