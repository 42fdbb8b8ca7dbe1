// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Moves channel events off the router thread.
//!
//! Handlers run on the router thread and stall it while they work. Installing a [QueueHandler]
//! instead copies every event and its payload into a bounded queue that any thread can drain.

use crate::dispatch::{ChannelHandler, SharedBuffer};
use crate::message::{EventCode, MessageBuffer};
use packed_struct::PrimitiveEnum;
use std::sync::PoisonError;
use thingbuf::mpsc::blocking::{channel, Receiver, Sender};
use thingbuf::mpsc::errors::TrySendError;
use tracing::warn;

/// A channel event captured on the router thread
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueuedEvent {
    pub channel: u8,
    pub event: u8,
    pub data: MessageBuffer,
}

impl QueuedEvent {
    pub fn event_code(&self) -> Option<EventCode> {
        EventCode::from_primitive(self.event)
    }
}

pub type EventReceiver = Receiver<QueuedEvent>;

pub struct QueueHandler {
    sender: Sender<QueuedEvent>,
    buffer: SharedBuffer,
}

impl QueueHandler {
    /// Returns the handler to install along with the read side of its queue. `buffer` must be
    /// the buffer registered with the handler.
    pub fn new(buffer: SharedBuffer, capacity: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = channel(capacity);
        (Self { sender, buffer }, receiver)
    }
}

impl ChannelHandler for QueueHandler {
    fn on_channel_event(&self, channel: u8, event: u8) -> bool {
        let data = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match self.sender.try_send(QueuedEvent {
            channel,
            event,
            data,
        }) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) => {
                warn!(channel, event, "event queue full, dropping event");
                false
            }
            Err(_) => false,
        }
    }
}
