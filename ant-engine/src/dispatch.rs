// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::message::MessageBuffer;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Channel slots available to the application. Devices may support fewer.
pub const MAX_CHANNELS: usize = 8;

/// Buffer shared between the application and the router thread.
///
/// The router overwrites it before every callback, so a handler must copy out anything it wants
/// to keep before returning.
pub type SharedBuffer = Arc<Mutex<MessageBuffer>>;

pub fn new_shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(MessageBuffer::new()))
}

/// Receives channel events and received data for one channel. Runs on the router thread.
pub trait ChannelHandler: Send + Sync {
    /// `event` is an [EventCode](crate::message::EventCode) value, the payload sits in the
    /// channel's buffer. The return value is informational only.
    fn on_channel_event(&self, channel: u8, event: u8) -> bool;
}

impl<F> ChannelHandler for F
where
    F: Fn(u8, u8) -> bool + Send + Sync,
{
    fn on_channel_event(&self, channel: u8, event: u8) -> bool {
        self(channel, event)
    }
}

/// Receives command responses and unsolicited device messages. Runs on the router thread.
pub trait ResponseHandler: Send + Sync {
    /// `message_id` is `0x40` for command responses, otherwise the raw id of the message held
    /// in the response buffer.
    fn on_response(&self, channel: u8, message_id: u8) -> bool;
}

impl<F> ResponseHandler for F
where
    F: Fn(u8, u8) -> bool + Send + Sync,
{
    fn on_response(&self, channel: u8, message_id: u8) -> bool {
        self(channel, message_id)
    }
}

fn fill(buffer: &SharedBuffer, data: &[u8]) {
    let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    buf.clear();
    let take = data.len().min(buf.capacity());
    buf.extend(data[..take].iter().copied());
}

#[derive(Clone)]
pub struct ChannelSlot {
    pub handler: Arc<dyn ChannelHandler>,
    pub buffer: SharedBuffer,
}

impl ChannelSlot {
    /// Copies `data` into the slot buffer, releases it, then runs the handler
    pub fn deliver(&self, channel: u8, event: u8, data: &[u8]) -> bool {
        fill(&self.buffer, data);
        self.handler.on_channel_event(channel, event)
    }
}

#[derive(Clone)]
pub struct ResponseSlot {
    pub handler: Arc<dyn ResponseHandler>,
    pub buffer: SharedBuffer,
}

impl ResponseSlot {
    pub fn deliver(&self, channel: u8, message_id: u8, data: &[u8]) -> bool {
        fill(&self.buffer, data);
        self.handler.on_response(channel, message_id)
    }
}

/// Per channel callbacks plus the catch-all response slot.
///
/// Not synchronized, the owner wraps it in a lock.
#[derive(Default)]
pub struct DispatchTable {
    channels: [Option<ChannelSlot>; MAX_CHANNELS],
    response: Option<ResponseSlot>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the handler for `channel`. Channels past [MAX_CHANNELS] are ignored.
    pub fn assign(&mut self, channel: u8, handler: Arc<dyn ChannelHandler>, buffer: SharedBuffer) {
        match self.channels.get_mut(channel as usize) {
            Some(slot) => *slot = Some(ChannelSlot { handler, buffer }),
            None => trace!(channel, "ignoring handler for out of range channel"),
        }
    }

    pub fn unassign(&mut self, channel: u8) {
        if let Some(slot) = self.channels.get_mut(channel as usize) {
            *slot = None;
        }
    }

    pub fn set_response(&mut self, handler: Arc<dyn ResponseHandler>, buffer: SharedBuffer) {
        self.response = Some(ResponseSlot { handler, buffer });
    }

    pub fn unassign_all(&mut self) {
        self.channels.iter_mut().for_each(|x| *x = None);
        self.response = None;
    }

    pub fn lookup(&self, channel: u8) -> Option<&ChannelSlot> {
        self.channels.get(channel as usize)?.as_ref()
    }

    pub fn response(&self) -> Option<&ResponseSlot> {
        self.response.as_ref()
    }
}
