// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # ANT message engine
//!
//! ## Introduction
//!
//! This crate drives an ANT radio (a USB stick or a UART attached module) from a host. It frames
//! and deframes the binary serial protocol, runs a background router thread that turns the inbound
//! byte stream into channel events and command responses, and lets callers issue commands either
//! fire-and-forget or synchronously with a timeout.
//!
//! For documentation of the actual implementation of the ANT stack and what each of these
//! individual messages do please visit the ant website at [thisisant.com](https://www.thisisant.com/)
//!
//! ## Features
//!  * `usb`: bulk endpoint access to ANT USB sticks through libusb
//!  * `tty`: ANT sticks and modules exposed as OS serial devices
//!  * Any embedded-hal serial port can be used through [transport::SerialTransport]
//!  * Message buffer size raised at build time with `ANT_MESSAGE_BUF_SIZE` for advanced burst
//!
//! ## Usage
//!
//! ```no_run
//! use ant_engine::commands::ChannelType;
//! use ant_engine::{new_shared_buffer, DeviceSelector, Engine, EngineConfig};
//! use std::time::Duration;
//!
//! let engine = Engine::init(DeviceSelector::Usb(0), EngineConfig::default()).unwrap();
//! let buffer = new_shared_buffer();
//! let data = buffer.clone();
//! engine.set_channel_handler(0, move |channel: u8, event: u8| {
//!     println!("{} {:#04x} {:?}", channel, event, data.lock().unwrap());
//!     true
//! }, buffer);
//!
//! let timeout = Duration::from_millis(500);
//! engine.assign_channel_with_timeout(0, ChannelType::BidirectionalSlave, 0, timeout).unwrap();
//! engine.set_channel_id_with_timeout(0, 0, 120, 0, timeout).unwrap();
//! engine.set_channel_rf_frequency_with_timeout(0, 57, timeout).unwrap();
//! engine.open_channel_with_timeout(0, timeout).unwrap();
//! ```

pub mod commands;
pub mod dispatch;
pub mod engine;
pub mod framer;
pub mod message;
pub mod queue;
pub mod router;
pub mod tracker;
pub mod transport;

pub use dispatch::{new_shared_buffer, ChannelHandler, ResponseHandler, SharedBuffer, MAX_CHANNELS};
pub use engine::{status_of, DeviceSelector, Engine, EngineConfig, EngineError};
pub use message::{EventCode, Message, MessageId};
pub use router::RouterState;
pub use tracker::{CancelFlag, ResponseStatus};
