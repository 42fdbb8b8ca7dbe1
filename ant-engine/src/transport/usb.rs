// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

// Bulk endpoint access for ANT USB sticks. Needed on MacOS, on Linux the sticks can also be
// reached as serial devices through the tty transport.

use crate::transport::{Transport, TransportError};
use rusb::{Device, DeviceHandle, Direction, Interface, TransferType, UsbContext};
use std::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Per chunk timeout when pushing bytes out
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UsbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    in_address: u8,
    out_address: u8,
    iface: u8,
    in_max_packet_size: usize,
    out_max_packet_size: usize,
    /// Bytes of the last bulk packet that did not fit the caller's buffer
    in_buf: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

#[derive(Debug)]
pub enum UsbError {
    CannotFindEndpoint(Direction),
    FailedToOpenDevice(rusb::Error),
    MissingConfig(rusb::Error),
    UnableToDetachDriver(rusb::Error),
    FailedToReset(rusb::Error),
    CantClaimIface(rusb::Error),
    NoInterfaces(),
}

impl From<UsbError> for TransportError {
    fn from(err: UsbError) -> Self {
        TransportError::UsbSetup(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDevice {
    vendor_id: u16,
    product_id: u16,
}

pub const USB_M_STICK: UsbDevice = UsbDevice {
    vendor_id: 0x0fcf,
    product_id: 0x1009,
};

pub const USB_2_STICK: UsbDevice = UsbDevice {
    vendor_id: 0x0fcf,
    product_id: 0x1008,
};

pub fn is_ant_usb_device(vendor_id: u16, product_id: u16) -> bool {
    matches!(
        (UsbDevice {
            vendor_id,
            product_id
        }),
        USB_M_STICK | USB_2_STICK
    )
}

pub fn is_ant_usb_device_from_device<T: UsbContext>(device: &Device<T>) -> bool {
    match device.device_descriptor() {
        Ok(d) => is_ant_usb_device(d.vendor_id(), d.product_id()),
        Err(_) => false,
    }
}

/// Returns the `index`th ANT stick visible on the bus
pub fn find_ant_device(index: usize) -> Result<Device<rusb::GlobalContext>, TransportError> {
    rusb::devices()?
        .iter()
        .filter(is_ant_usb_device_from_device)
        .nth(index)
        .ok_or_else(|| TransportError::NoDevice(format!("ANT USB stick #{}", index)))
}

fn find_endpoint(
    interface: &Interface,
    transfer_type: TransferType,
    endpoint_direction: Direction,
) -> Result<(u8, usize), UsbError> {
    for interface_desc in interface.descriptors() {
        for endpoint_desc in interface_desc.endpoint_descriptors() {
            if endpoint_desc.direction() == endpoint_direction
                && endpoint_desc.transfer_type() == transfer_type
            {
                return Ok((
                    endpoint_desc.address(),
                    endpoint_desc.max_packet_size() as usize,
                ));
            }
        }
    }
    Err(UsbError::CannotFindEndpoint(endpoint_direction))
}

impl<T: UsbContext> UsbTransport<T> {
    pub fn new(device: Device<T>) -> Result<Self, UsbError> {
        let mut handle = device.open().map_err(UsbError::FailedToOpenDevice)?;
        let config = device
            .config_descriptor(0)
            .map_err(UsbError::MissingConfig)?;

        let iface = match config.interfaces().next() {
            Some(iface) => iface,
            None => return Err(UsbError::NoInterfaces()),
        };

        let driver_active = matches!(handle.kernel_driver_active(iface.number()), Ok(true));

        let (out_address, out_max_packet_size) =
            find_endpoint(&iface, TransferType::Bulk, Direction::Out)?;
        let (in_address, in_max_packet_size) =
            find_endpoint(&iface, TransferType::Bulk, Direction::In)?;

        if driver_active {
            handle
                .detach_kernel_driver(iface.number())
                .map_err(UsbError::UnableToDetachDriver)?;
        }
        handle.reset().map_err(UsbError::FailedToReset)?;
        handle
            .claim_interface(iface.number())
            .map_err(UsbError::CantClaimIface)?;

        debug!(
            iface = iface.number(),
            in_address, out_address, "claimed ANT USB interface"
        );

        Ok(Self {
            handle,
            iface: iface.number(),
            in_address,
            out_address,
            in_max_packet_size,
            out_max_packet_size,
            in_buf: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Hands the interface back to the kernel
    pub fn release(mut self) -> Result<Device<T>, TransportError> {
        self.handle.release_interface(self.iface)?;
        if let Err(e) = self.handle.attach_kernel_driver(self.iface) {
            // Not every platform lets us reattach
            warn!("could not reattach kernel driver: {}", e);
        }
        Ok(self.handle.device())
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let chunk = &remaining[..min(remaining.len(), self.out_max_packet_size)];
            match self
                .handle
                .write_bulk(self.out_address, chunk, WRITE_TIMEOUT)
            {
                Ok(n) => remaining = &remaining[n..],
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_open()?;
        let mut in_buf = self.in_buf.lock().unwrap_or_else(PoisonError::into_inner);
        if in_buf.is_empty() {
            // Bulk reads must be packet aligned or the host controller overflows
            let mut packet = vec![0; self.in_max_packet_size.max(buf.len())];
            match self.handle.read_bulk(self.in_address, &mut packet, timeout) {
                Ok(len) => in_buf.extend_from_slice(&packet[..len]),
                Err(rusb::Error::Timeout) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(drain_into(&mut in_buf, buf))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Move as much of `pending` as fits into `buf`, keeping the rest for the next read
fn drain_into(pending: &mut Vec<u8>, buf: &mut [u8]) -> usize {
    let len = min(pending.len(), buf.len());
    buf[..len].copy_from_slice(&pending[..len]);
    pending.drain(..len);
    len
}
