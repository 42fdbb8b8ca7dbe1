// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Byte stream to [Message] conversion and back.
//!
//! ```text
//! [0xA4][length][id][payload; length][xor of all prior bytes]
//! ```

use crate::commands::Command;
use crate::message::{
    Message, CHECKSUM_SIZE, HEADER_SIZE, MAX_FRAME_SIZE, MAX_STANDARD_PAYLOAD_SIZE,
    MESSAGE_BUFFER_SIZE, SYNC_BYTE,
};
use packed_struct::PackingError;
use std::cmp;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FramingError {
    #[error("message has bad checksum: {0}, expected {1}")]
    BadChecksum(u8, u8),
    #[error("declared length {0} exceeds the {1} byte payload limit")]
    Oversize(usize, usize),
    #[error("payload of {0} bytes does not fit the {1} byte payload limit")]
    PayloadTooLarge(usize, usize),
    #[error("invalid byte pattern: {0:?}")]
    PackingError(PackingError),
}

impl From<PackingError> for FramingError {
    fn from(err: PackingError) -> Self {
        FramingError::PackingError(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramerConfig {
    /// Largest payload accepted in either direction.
    ///
    /// Standard devices never exceed 41 bytes, advanced burst profiles may raise this up to
    /// [MESSAGE_BUFFER_SIZE].
    pub max_payload: usize,
}

impl FramerConfig {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: cmp::min(max_payload, MESSAGE_BUFFER_SIZE),
        }
    }
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self::new(MAX_STANDARD_PAYLOAD_SIZE)
    }
}

pub fn calculate_checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |acc, x| acc ^ x)
}

/// Offset of the first sync byte, everything before it is noise. An empty or sync free buffer is
/// discarded entirely.
fn align_buffer(buf: &[u8]) -> usize {
    buf.iter()
        .position(|&x| x == SYNC_BYTE)
        .unwrap_or(buf.len())
}

fn frame_size(payload_len: usize) -> usize {
    payload_len + HEADER_SIZE + CHECKSUM_SIZE
}

/// Assumes `buf` starts on a sync byte
fn parse_buffer(buf: &[u8], max_payload: usize) -> Result<Option<Message>, FramingError> {
    // Not enough bytes
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let msg_length = buf[1] as usize;
    if msg_length > max_payload {
        return Err(FramingError::Oversize(msg_length, max_payload));
    }

    if buf.len() < frame_size(msg_length) {
        return Ok(None);
    }

    let end = msg_length + HEADER_SIZE;
    let expected_checksum = calculate_checksum(&buf[..end]);
    let checksum = buf[end];
    if expected_checksum != checksum {
        return Err(FramingError::BadChecksum(checksum, expected_checksum));
    }

    Message::new(buf[2], &buf[HEADER_SIZE..end])
        .map(Some)
        .map_err(|_| FramingError::Oversize(msg_length, MESSAGE_BUFFER_SIZE))
}

/// Incremental deframer for one inbound byte stream
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
    config: FramerConfig,
    drain_pending: bool,
}

impl Framer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_SIZE),
            config,
            drain_pending: false,
        }
    }

    pub fn config(&self) -> FramerConfig {
        self.config
    }

    /// Append bytes read from the transport, chunk boundaries do not matter
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete message out of the buffered bytes.
    ///
    /// `Ok(None)` means more bytes are needed. After an `Err` the errored frame is still
    /// buffered: the following call absorbs it and returns `Ok(None)`, so callers must call this
    /// twice after an error before expecting the next real message.
    pub fn get_message(&mut self) -> Result<Option<Message>, FramingError> {
        if self.drain_pending {
            self.drain_pending = false;
            // Drop the rejected sync byte so we realign on the next candidate frame
            let skip = cmp::min(1, self.buffer.len());
            self.buffer.drain(..skip);
            self.realign();
            return Ok(None);
        }

        self.realign();
        let msg = parse_buffer(&self.buffer, self.config.max_payload);
        match &msg {
            Err(_) => self.drain_pending = true,
            Ok(Some(data)) => {
                // Never over-drain in case the buffer is somehow shorter than the parsed frame
                let amount = cmp::min(frame_size(data.size()), self.buffer.len());
                self.buffer.drain(..amount);
            }
            Ok(None) => (),
        }
        msg
    }

    fn realign(&mut self) {
        let start = align_buffer(&self.buffer);
        if start != 0 {
            trace!(discarded = start, "resynchronizing byte stream");
            self.buffer.drain(..start);
        }
    }

    /// Frame a raw id and payload into `buf`
    pub fn encode_frame<'a>(
        &self,
        id: u8,
        payload: &[u8],
        buf: &'a mut [u8],
    ) -> Result<&'a [u8], FramingError> {
        let limit = cmp::min(self.config.max_payload, u8::MAX as usize);
        if payload.len() > limit {
            return Err(FramingError::PayloadTooLarge(payload.len(), limit));
        }
        let total = frame_size(payload.len());
        if buf.len() < total {
            return Err(FramingError::PayloadTooLarge(
                payload.len(),
                buf.len().saturating_sub(HEADER_SIZE + CHECKSUM_SIZE),
            ));
        }
        buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Ok(finish_frame(buf, id, payload.len()))
    }

    /// Frame a typed command into `buf`
    pub fn encode_command<'a>(
        &self,
        msg: &dyn Command,
        buf: &'a mut [u8],
    ) -> Result<&'a [u8], FramingError> {
        if buf.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(FramingError::PayloadTooLarge(0, 0));
        }
        let body_end = buf.len() - CHECKSUM_SIZE;
        let msg_len = msg.encode(&mut buf[HEADER_SIZE..body_end])?;
        if msg_len > self.config.max_payload {
            return Err(FramingError::PayloadTooLarge(
                msg_len,
                self.config.max_payload,
            ));
        }
        Ok(finish_frame(buf, msg.message_id() as u8, msg_len))
    }
}

/// Fill in header and checksum around a payload already placed after the header
fn finish_frame(buf: &mut [u8], id: u8, msg_len: usize) -> &[u8] {
    buf[0] = SYNC_BYTE;
    buf[1] = msg_len as u8;
    buf[2] = id;
    let padded_len = msg_len + HEADER_SIZE;
    buf[padded_len] = calculate_checksum(&buf[..padded_len]);
    &buf[..padded_len + CHECKSUM_SIZE]
}
