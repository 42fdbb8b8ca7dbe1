// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Typed host to device commands.
//!
//! Every command packs itself into the payload portion of a frame, the framer adds sync, length,
//! id and checksum.

use crate::message::{
    MessageId, CHANNEL_NUMBER_MASK, SEQUENCE_NUMBER_MASK, STANDARD_PAYLOAD_SIZE,
};
use ant_engine_derive::AntCommand;
use const_utils::u64::min;
use core::time::Duration;
use derive_new::new;
use packed_struct::prelude::*;

/// Trait for any message the host can send
pub trait Command {
    fn message_id(&self) -> MessageId;
    /// Channel the device will echo in its response, `None` for device wide commands
    fn channel(&self) -> Option<u8>;
    /// Pack the payload into `buf`, returning the number of bytes written
    fn encode(&self, buf: &mut [u8]) -> Result<usize, PackingError>;
}

/// Represents a UnAssign Channel message (0x41)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "1")]
pub struct UnAssignChannel {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Default)]
pub enum ChannelType {
    #[default]
    BidirectionalSlave = 0x00,
    BidirectionalMaster = 0x10,
    SharedBidirectionalSlave = 0x20,
    SharedBidirectionalMaster = 0x30,
    SharedReceiveOnly = 0x40,
    MasterTransmitOnly = 0x50,
}

/// Represents a Assign Channel message (0x42)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "3")]
pub struct AssignChannel {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    #[packed_field(bytes = "1", ty = "enum")]
    pub channel_type: ChannelType,
    /// Which network key to use, set keys via [SetNetworkKey]
    #[packed_field(bytes = "2")]
    pub network_number: u8,
}

/// Represents a Channel Id message (0x51)
///
/// Zero in any field is a wildcard when searching.
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "5")]
pub struct ChannelId {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    #[packed_field(bytes = "1:2")]
    pub device_number: u16,
    #[packed_field(bytes = "3")]
    pub device_type: u8,
    #[packed_field(bytes = "4")]
    pub transmission_type: u8,
}

/// Represents a Channel Period message (0x43)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "3")]
pub struct ChannelPeriod {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    /// Message period in units of 1/32768 s
    #[packed_field(bytes = "1:2")]
    pub channel_period: u16,
}

/// Represents a Search Timeout message (0x44)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct SearchTimeout {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    /// 2.5 s per count, 255 disables the timeout
    #[packed_field(bytes = "1")]
    pub search_timeout: u8,
}

impl SearchTimeout {
    /// Builds a search timeout from a duration, rounding down to 2.5 s steps
    pub fn from_duration(channel_number: u8, timeout: Duration) -> Self {
        Self::new(channel_number, duration_to_search_timeout(timeout))
    }
}

/// Helper to convert durations to search timeouts.
/// Anything greater than or equal to 637.5s will default to infinite timeout per ANT spec.
pub const fn duration_to_search_timeout(t: Duration) -> u8 {
    // Scale up by 10 to avoid floating point math as ratio is 2.5s to 1 count
    min((t.as_secs() * 10) / 25, 255) as u8
}

/// Represents a Channel RF Frequency message (0x45)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct ChannelRfFrequency {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    /// Offset from 2400 MHz in MHz
    #[packed_field(bytes = "1")]
    pub rf_frequency: u8,
}

/// Represents a Set Network Key message (0x46)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "9")]
pub struct SetNetworkKey {
    #[packed_field(bytes = "0")]
    pub network_number: u8,
    #[packed_field(bytes = "1:8")]
    pub network_key: [u8; 8],
}

/// Represents a Transmit Power message (0x47), applies to every channel
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct TransmitPower {
    #[new(default)]
    #[packed_field(bytes = "0")]
    _reserved: ReservedZeroes<packed_bits::Bits<8>>,
    #[packed_field(bytes = "1")]
    pub tx_power: u8,
}

/// Represents a Set Channel Transmit Power message (0x60)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct SetChannelTransmitPower {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    #[packed_field(bytes = "1")]
    pub tx_power: u8,
}

/// Represents a Enable Ext Rx Messages message (0x66)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct EnableExtRxMessages {
    #[new(default)]
    #[packed_field(bits = "0:14")]
    _reserved: ReservedZeroes<packed_bits::Bits<15>>,
    #[packed_field(bits = "15")]
    pub enable: bool,
}

/// Represents a Lib Config message (0x6E), selects the tail appended to flagged data
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct LibConfig {
    #[new(default)]
    #[packed_field(bytes = "0")]
    _reserved0: ReservedZeroes<packed_bits::Bits<8>>,
    #[packed_field(bits = "8")]
    pub enable_channel_id_output: bool,
    #[packed_field(bits = "9")]
    pub enable_rssi_output: bool,
    #[packed_field(bits = "10")]
    pub enable_rx_timestamp_output: bool,
    #[new(default)]
    #[packed_field(bits = "11:15")]
    _reserved1: ReservedZeroes<packed_bits::Bits<5>>,
}

/// Represents a Reset System message (0x4A), the device answers with a startup message
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "1")]
pub struct ResetSystem {
    #[new(default)]
    #[packed_field(bytes = "0")]
    _reserved: ReservedZeroes<packed_bits::Bits<8>>,
}

/// Represents a Open Channel message (0x4B)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "1")]
pub struct OpenChannel {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
}

/// Represents a Close Channel message (0x4C)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "1")]
pub struct CloseChannel {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
}

/// Represents a Request Message message (0x4D)
///
/// `message_id` is raw so any requestable id can be asked for, including ones newer than this
/// crate. The response arrives as a message carrying that id.
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "2")]
pub struct RequestMessage {
    #[packed_field(bytes = "0")]
    pub channel: u8,
    #[packed_field(bytes = "1")]
    pub message_id: u8,
}

/// Represents a Broadcast Data message (0x4E)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "9")]
pub struct BroadcastData {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    #[packed_field(bytes = "1:8")]
    pub data: [u8; 8],
}

/// Represents a Acknowledged Data message (0x4F)
#[derive(PackedStruct, AntCommand, new, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "9")]
pub struct AcknowledgedData {
    #[packed_field(bytes = "0")]
    pub channel_number: u8,
    #[packed_field(bytes = "1:8")]
    pub data: [u8; 8],
}

/// Represents a Burst Transfer Data message (0x50)
#[derive(PackedStruct, AntCommand, Clone, Copy, Debug, Default, PartialEq)]
#[packed_struct(bit_numbering = "msb0", endian = "lsb", size_bytes = "9")]
pub struct BurstTransferData {
    /// Channel in the low 5 bits, sequence in the high 3
    #[packed_field(bytes = "0")]
    pub channel_sequence: u8,
    #[packed_field(bytes = "1:8")]
    pub data: [u8; 8],
}

/// Flag OR'd into the sequence of the final packet of a burst
pub const SEQUENCE_LAST_MESSAGE: u8 = 0x80;
const SEQUENCE_NUMBER_INC: u8 = 0x20;
const SEQUENCE_NUMBER_ROLLOVER: u8 = 0x60;

impl BurstTransferData {
    pub fn new(channel_number: u8, sequence: u8, data: [u8; 8]) -> Self {
        Self {
            channel_sequence: (channel_number & CHANNEL_NUMBER_MASK)
                | (sequence & SEQUENCE_NUMBER_MASK),
            data,
        }
    }

    /// Split `data` into burst packets with sequence numbers filled in.
    ///
    /// Sequence runs 0, 1, 2, 3, 1, 2, 3, ... and the last packet carries
    /// [SEQUENCE_LAST_MESSAGE]. The final packet is zero padded.
    pub fn packets(channel_number: u8, data: &[u8]) -> Vec<BurstTransferData> {
        let count = data.len().div_ceil(STANDARD_PAYLOAD_SIZE);
        let mut sequence = 0u8;
        data.chunks(STANDARD_PAYLOAD_SIZE)
            .enumerate()
            .map(|(i, chunk)| {
                let mut payload = [0u8; STANDARD_PAYLOAD_SIZE];
                payload[..chunk.len()].copy_from_slice(chunk);
                let mut seq = sequence;
                if i + 1 == count {
                    seq |= SEQUENCE_LAST_MESSAGE;
                }
                sequence = if sequence == SEQUENCE_NUMBER_ROLLOVER {
                    SEQUENCE_NUMBER_INC
                } else {
                    sequence + SEQUENCE_NUMBER_INC
                };
                BurstTransferData::new(channel_number, seq, payload)
            })
            .collect()
    }

    pub fn channel_number(&self) -> u8 {
        self.channel_sequence & CHANNEL_NUMBER_MASK
    }
}
