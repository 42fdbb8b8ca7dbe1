// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::transport::{Transport, TransportError};
use embedded_hal::digital::{ErrorType, OutputPin, PinState};
use embedded_hal_nb::serial::{Error as _, Read, Write};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How long to back off when the UART has nothing for us
const READ_BACKOFF: Duration = Duration::from_millis(1);

struct SerialInner<SERIAL, SLEEP> {
    serial: SERIAL,
    sleep: Option<SLEEP>,
}

/// Transport over any non-blocking embedded-hal UART, with the optional SLEEP line of serial
/// ANT modules driven low around each write.
pub struct SerialTransport<SERIAL, SLEEP> {
    inner: Mutex<SerialInner<SERIAL, SLEEP>>,
    closed: AtomicBool,
}

impl<SERIAL, SLEEP> SerialTransport<SERIAL, SLEEP>
where
    SERIAL: Read<u8> + Write<u8>,
    SLEEP: OutputPin,
{
    pub fn new(serial: SERIAL, sleep: Option<SLEEP>) -> SerialTransport<SERIAL, SLEEP> {
        SerialTransport {
            inner: Mutex::new(SerialInner { serial, sleep }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn release(self) -> (SERIAL, Option<SLEEP>) {
        let inner = self
            .inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        (inner.serial, inner.sleep)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SerialInner<SERIAL, SLEEP>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn set_sleep<P: OutputPin>(pin: &mut Option<P>, state: PinState) -> Result<(), TransportError> {
    if let Some(pin) = pin {
        if pin.set_state(state).is_err() {
            return Err(TransportError::PinChange(state));
        }
    }
    Ok(())
}

impl<SERIAL, SLEEP> Transport for SerialTransport<SERIAL, SLEEP>
where
    SERIAL: Read<u8> + Write<u8> + Send,
    SLEEP: OutputPin + Send,
{
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        set_sleep(&mut inner.sleep, PinState::Low)?;

        for byte in bytes {
            nb::block!(inner.serial.write(*byte))
                .map_err(|e| TransportError::Serial(e.kind()))?;
        }
        nb::block!(inner.serial.flush()).map_err(|e| TransportError::Serial(e.kind()))?;

        set_sleep(&mut inner.sleep, PinState::High)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut count = 0;
            {
                let mut inner = self.lock()?;
                while count < buf.len() {
                    match inner.serial.read() {
                        Ok(d) => {
                            buf[count] = d;
                            count += 1;
                        }
                        Err(nb::Error::WouldBlock) => break,
                        Err(nb::Error::Other(e)) => return Err(TransportError::Serial(e.kind())),
                    }
                }
            }
            if count > 0 || Instant::now() >= deadline {
                return Ok(count);
            }
            // Lock is released here so writers are never starved by an idle line
            thread::sleep(READ_BACKOFF);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// This is a Pin type for devices that do not wish to use the sleep line, this includes USB use
/// cases
pub struct StubPin {}

impl ErrorType for StubPin {
    type Error = Infallible;
}

impl OutputPin for StubPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
