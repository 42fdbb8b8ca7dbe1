// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use arrayvec::{ArrayVec, CapacityError};
use const_utils::{max, min};
use konst::{option::unwrap_or, primitive::parse_usize, unwrap_ctx};
use packed_struct::prelude::*;

/// Sync byte that opens every frame in both directions
pub const SYNC_BYTE: u8 = 0xA4;
pub(crate) const HEADER_SIZE: usize = 3;
pub(crate) const CHECKSUM_SIZE: usize = 1;

/// Data bytes carried by a standard broadcast, acknowledged or burst packet
pub const STANDARD_PAYLOAD_SIZE: usize = 8;
/// Channel byte plus a standard data payload
pub const STANDARD_DATA_SIZE: usize = STANDARD_PAYLOAD_SIZE + 1;
/// Channel byte, 4 byte channel id and a standard data payload (legacy extended messages)
pub const EXTENDED_DATA_SIZE: usize = STANDARD_DATA_SIZE + ChannelIdOutput::PACKING_SIZE;
/// Largest payload a standard ANT device will ever declare
pub const MAX_STANDARD_PAYLOAD_SIZE: usize = 41;

/// Capacity of every message buffer, including the ones handed to channel handlers.
///
/// Advanced burst users can raise it at build time through `ANT_MESSAGE_BUF_SIZE`. Values are
/// clamped between the standard ceiling and the largest length a frame can declare.
pub const MESSAGE_BUFFER_SIZE: usize = min(
    max(
        unwrap_ctx!(parse_usize(unwrap_or!(
            option_env!("ANT_MESSAGE_BUF_SIZE"),
            "64"
        ))),
        MAX_STANDARD_PAYLOAD_SIZE,
    ),
    u8::MAX as usize,
);

/// Largest frame on the wire, header and checksum included
pub const MAX_FRAME_SIZE: usize = MESSAGE_BUFFER_SIZE + HEADER_SIZE + CHECKSUM_SIZE;

/// Lower 5 bits of the first payload byte hold the channel
pub const CHANNEL_NUMBER_MASK: u8 = 0x1F;
/// Upper 3 bits of the first byte of burst packets hold the sequence
pub const SEQUENCE_NUMBER_MASK: u8 = 0xE0;

pub(crate) const CHANNEL_OFFSET: usize = 0;
pub(crate) const RESPONSE_ID_OFFSET: usize = 1;
pub(crate) const EVENT_CODE_OFFSET: usize = 2;
/// Value found at [RESPONSE_ID_OFFSET] of a `0x40` message when it is a channel event rather than
/// a command response
pub(crate) const RESPONSE_IS_EVENT: u8 = 1;

pub type MessageBuffer = ArrayVec<u8, MESSAGE_BUFFER_SIZE>;

/// A validated message as it came off (or goes onto) the wire, minus framing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub payload: MessageBuffer,
}

impl Message {
    pub fn new(id: u8, payload: &[u8]) -> Result<Self, CapacityError> {
        let mut buffer = MessageBuffer::new();
        buffer.try_extend_from_slice(payload)?;
        Ok(Self {
            id,
            payload: buffer,
        })
    }

    /// Payload length as declared by the frame
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        MessageId::from_primitive(self.id)
    }

    /// Channel carried in the first payload byte with any burst sequence bits removed
    pub fn channel_number(&self) -> u8 {
        self.payload
            .get(CHANNEL_OFFSET)
            .map_or(0, |c| c & CHANNEL_NUMBER_MASK)
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    // Config Messages
    UnAssignChannel = 0x41,
    AssignChannel = 0x42,
    ChannelId = 0x51,
    ChannelPeriod = 0x43,
    SearchTimeout = 0x44,
    ChannelRfFrequency = 0x45,
    SetNetworkKey = 0x46,
    TransmitPower = 0x47,
    SetChannelTransmitPower = 0x60,
    EnableExtRxMessages = 0x66,
    LibConfig = 0x6E,
    // Control Messages
    ResetSystem = 0x4A,
    OpenChannel = 0x4B,
    CloseChannel = 0x4C,
    RequestMessage = 0x4D,
    // Data Messages
    BroadcastData = 0x4E,
    AcknowledgedData = 0x4F,
    BurstTransferData = 0x50,
    AdvancedBurstData = 0x72,
    // Extended Data Messages (Legacy)
    ExtendedBroadcastData = 0x5D,
    ExtendedAcknowledgedData = 0x5E,
    ExtendedBurstData = 0x5F,
    // Channel Messages, carries both responses and events
    ChannelEvent = 0x40,
    // Requested Response Messages
    ChannelStatus = 0x52,
    AntVersion = 0x3E,
    Capabilities = 0x54,
    SerialNumber = 0x61,
    // Notification Messages
    StartUpMessage = 0x6F,
    SerialErrorMessage = 0xAE,
}

impl MessageId {
    /// Requested responses whose first byte is a channel number rather than device data
    pub fn is_channel_scoped(self) -> bool {
        matches!(self, MessageId::ChannelId | MessageId::ChannelStatus)
    }
}

/// Codes delivered to channel and response handlers.
///
/// Values below 0x7D come straight off the wire in `0x40` messages, the `EventRx*` family is
/// synthesized by the router when data arrives.
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCode {
    ResponseNoError = 0x00,
    EventRxSearchTimeout = 0x01,
    EventRxFail = 0x02,
    EventTx = 0x03,
    EventTransferRxFailed = 0x04,
    EventTransferTxCompleted = 0x05,
    EventTransferTxFailed = 0x06,
    EventChannelClosed = 0x07,
    EventRxFailGoToSearch = 0x08,
    EventChannelCollision = 0x09,
    EventTransferTxStart = 0x0A,
    EventTransferNextDataBlock = 0x11,
    ChannelInWrongState = 0x15,
    ChannelNotOpened = 0x16,
    ChannelIdNotSet = 0x18,
    CloseAllChannels = 0x19,
    TransferInProgress = 0x1F,
    TransferSequenceNumberError = 0x20,
    TransferInError = 0x21,
    MessageSizeExceedsLimit = 0x27,
    InvalidMessage = 0x28,
    InvalidNetworkNumber = 0x29,
    InvalidListId = 0x30,
    InvalidScanTxChannel = 0x31,
    InvalidParameterProvided = 0x32,
    EventSerialQueOverflow = 0x34,
    EventQueOverflow = 0x35,
    EncryptNegotiationSuccess = 0x38,
    EncryptNegotiationFail = 0x39,
    NvmFullError = 0x40,
    NvmWriteError = 0x41,
    UsbStringWriteFail = 0x70,
    EventRxFlagAcknowledged = 0x7D,
    EventRxFlagBurstPacket = 0x7E,
    EventRxFlagBroadcast = 0x7F,
    EventRxBroadcast = 0x9A,
    EventRxAcknowledged = 0x9B,
    EventRxBurstPacket = 0x9C,
    EventRxExtBroadcast = 0x9D,
    EventRxExtAcknowledged = 0x9E,
    EventRxExtBurstPacket = 0x9F,
    MesgSerialErrorId = 0xAE,
}

impl From<EventCode> for u8 {
    fn from(code: EventCode) -> u8 {
        code.to_primitive()
    }
}

/// Set in the flag byte when a channel id follows it
pub const FLAG_CHANNEL_ID: u8 = 0x80;

/// Channel id appended to flagged data messages when extended output is enabled
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "4")]
pub struct ChannelIdOutput {
    #[packed_field(bytes = "0:1")]
    pub device_number: u16,
    #[packed_field(bytes = "2")]
    pub device_type: u8,
    #[packed_field(bytes = "3")]
    pub transmission_type: u8,
}

impl ChannelIdOutput {
    pub const PACKING_SIZE: usize = 4;

    /// Reads the sender's channel id from the tail of a flagged data buffer.
    ///
    /// `data` is the buffer handed to a channel handler for an `EventRxFlag*` event: channel
    /// byte, 8 data bytes, flag byte, then the channel id.
    pub fn from_flagged(data: &[u8]) -> Option<Self> {
        let flag = *data.get(STANDARD_DATA_SIZE)?;
        if flag & FLAG_CHANNEL_ID == 0 {
            return None;
        }
        let start = STANDARD_DATA_SIZE + 1;
        let tail = data.get(start..start + Self::PACKING_SIZE)?;
        Self::unpack_from_slice(tail).ok()
    }

    /// Reads the channel id embedded in a legacy extended data message (`0x5D`..`0x5F`)
    pub fn from_extended(data: &[u8]) -> Option<Self> {
        let tail = data.get(1..1 + Self::PACKING_SIZE)?;
        Self::unpack_from_slice(tail).ok()
    }
}
