// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::commands::{
    AcknowledgedData, AssignChannel, BroadcastData, BurstTransferData, ChannelId, ChannelPeriod,
    ChannelRfFrequency, ChannelType, CloseChannel, Command, EnableExtRxMessages, LibConfig,
    OpenChannel, RequestMessage, ResetSystem, SearchTimeout, SetChannelTransmitPower,
    SetNetworkKey, TransmitPower, UnAssignChannel,
};
use crate::dispatch::{new_shared_buffer, ChannelHandler, ResponseHandler, SharedBuffer};
use crate::framer::{Framer, FramerConfig, FramingError};
use crate::message::{
    EventCode, Message, MessageId, EVENT_CODE_OFFSET, MAX_FRAME_SIZE, MAX_STANDARD_PAYLOAD_SIZE,
    RESPONSE_ID_OFFSET,
};
use crate::queue::{EventReceiver, QueueHandler};
use crate::router::{Router, RouterState, Shared};
use crate::tracker::{
    ActiveTransfer, CancelFlag, ResponseStatus, TransferKind, TransferOutcome, WaitError,
    WaitPolicy,
};
use crate::transport::{Transport, TransportError, DEFAULT_BAUD_RATE};
use packed_struct::PrimitiveEnum;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Only used when opening serial devices
    pub baud_rate: u32,
    /// Longest the router blocks in a transport read, bounds how long [Engine::close] takes
    pub poll_interval: Duration,
    /// How often blocked calls look at the cancel flag
    pub cancel_poll_interval: Duration,
    /// Payload ceiling in both directions, see [FramerConfig]
    pub max_payload: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            poll_interval: Duration::from_secs(1),
            cancel_poll_interval: Duration::from_millis(10),
            max_payload: MAX_STANDARD_PAYLOAD_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// Which device [Engine::init] should open
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Nth ANT stick on the USB bus
    #[cfg(feature = "usb")]
    Usb(usize),
    /// Serial device path, e.g. `/dev/ttyUSB0`
    #[cfg(feature = "tty")]
    Tty(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not frame message: {0}")]
    Framing(#[from] FramingError),
    #[error("failed to start router thread: {0}")]
    Spawn(std::io::Error),
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("engine is closed")]
    Closed,
    #[error("device rejected message {message_id:#04x} with code {code:#04x}")]
    Rejected { message_id: u8, code: u8 },
    #[error("transfer on channel {channel} failed")]
    TransferFailed { channel: u8 },
    #[error("close called from the router thread")]
    CloseFromRouterThread,
}

impl From<WaitError> for EngineError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => EngineError::Timeout,
            WaitError::Cancelled => EngineError::Cancelled,
            WaitError::Closed => EngineError::Closed,
        }
    }
}

impl EngineError {
    pub fn status(&self) -> ResponseStatus {
        match self {
            EngineError::Timeout => ResponseStatus::Timeout,
            EngineError::Cancelled => ResponseStatus::Cancelled,
            _ => ResponseStatus::Fail,
        }
    }

    /// Device response code for [EngineError::Rejected]
    pub fn rejection_code(&self) -> Option<EventCode> {
        match self {
            EngineError::Rejected { code, .. } => EventCode::from_primitive(*code),
            _ => None,
        }
    }
}

/// Collapse a synchronous call result into its status code
pub fn status_of<T>(result: &Result<T, EngineError>) -> ResponseStatus {
    match result {
        Ok(_) => ResponseStatus::Pass,
        Err(e) => e.status(),
    }
}

/// One open connection to an ANT device.
///
/// Owns the transport and the router thread feeding handlers. All methods take `&self` so the
/// engine can be shared across threads behind an `Arc`. Blocking `*_with_timeout` calls must not
/// be made from inside a handler since handlers run on the router thread.
pub struct Engine {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    encoder: Framer,
    config: EngineConfig,
    cancel: Mutex<Option<CancelFlag>>,
    write_lock: Mutex<()>,
    router: Mutex<Option<JoinHandle<()>>>,
    router_id: ThreadId,
    closed: AtomicBool,
}

impl Engine {
    /// Open the selected device and start routing
    pub fn init(device: DeviceSelector, config: EngineConfig) -> Result<Self, EngineError> {
        let transport: Arc<dyn Transport> = match device {
            #[cfg(feature = "usb")]
            DeviceSelector::Usb(index) => {
                let device = crate::transport::find_ant_device(index)?;
                Arc::new(crate::transport::UsbTransport::new(device).map_err(TransportError::from)?)
            }
            #[cfg(feature = "tty")]
            DeviceSelector::Tty(path) => {
                Arc::new(crate::transport::TtyTransport::open(&path, config.baud_rate)?)
            }
        };
        Self::with_transport(transport, config)
    }

    /// Start routing over an already open transport
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let framer_config = FramerConfig::new(config.max_payload);
        let shared = Arc::new(Shared::new());
        let handle = Router::new(
            transport.clone(),
            Framer::new(framer_config),
            shared.clone(),
            config.poll_interval,
        )
        .spawn()
        .map_err(EngineError::Spawn)?;
        let router_id = handle.thread().id();
        info!(max_payload = framer_config.max_payload, "engine started");

        Ok(Self {
            shared,
            transport,
            encoder: Framer::new(framer_config),
            config,
            cancel: Mutex::new(None),
            write_lock: Mutex::new(()),
            router: Mutex::new(Some(handle)),
            router_id,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RouterState {
        self.shared.state()
    }

    /// Stop the router, wait for it to exit and close the transport.
    ///
    /// Safe to call more than once. Fails if called from a handler.
    pub fn close(&self) -> Result<(), EngineError> {
        if thread::current().id() == self.router_id {
            return Err(EngineError::CloseFromRouterThread);
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.request_stop();
        self.shared.wait_stopped();
        let handle = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("router thread panicked");
            }
        }
        self.transport.close();
        info!("engine closed");
        Ok(())
    }

    /// Install the catch-all handler for command responses and device messages
    pub fn set_response_handler(
        &self,
        handler: impl ResponseHandler + 'static,
        buffer: SharedBuffer,
    ) {
        self.shared.table().set_response(Arc::new(handler), buffer);
    }

    /// Install the handler for events and data on `channel`. Channels past
    /// [MAX_CHANNELS](crate::dispatch::MAX_CHANNELS) are ignored.
    pub fn set_channel_handler(
        &self,
        channel: u8,
        handler: impl ChannelHandler + 'static,
        buffer: SharedBuffer,
    ) {
        self.shared.table().assign(channel, Arc::new(handler), buffer);
    }

    pub fn clear_all_handlers(&self) {
        self.shared.table().unassign_all();
    }

    /// Replace the handler of `channel` with a bounded queue, events beyond `capacity` are
    /// dropped until the receiver catches up. A zero capacity is raised to one.
    pub fn queue_channel_events(&self, channel: u8, capacity: usize) -> EventReceiver {
        if capacity == 0 {
            warn!(channel, "event queue capacity must be at least one");
        }
        let capacity = capacity.max(1);
        let buffer = new_shared_buffer();
        let (handler, receiver) = QueueHandler::new(buffer.clone(), capacity);
        self.set_channel_handler(channel, handler, buffer);
        receiver
    }

    /// Flag checked by every blocked call, `None` removes it
    pub fn set_cancel_flag(&self, flag: Option<CancelFlag>) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = flag;
    }

    fn cancel_flag(&self) -> Option<CancelFlag> {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn policy<'a>(&self, timeout: Duration, cancel: &'a Option<CancelFlag>) -> WaitPolicy<'a> {
        WaitPolicy {
            timeout,
            cancel: cancel.as_deref(),
            cancel_poll: self.config.cancel_poll_interval,
        }
    }

    fn write_frame(&self, frame: &[u8]) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) || self.state() != RouterState::Running {
            return Err(EngineError::Closed);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.transport.write(frame)?;
        Ok(())
    }

    /// Frame and write any message, bypassing the typed commands
    pub fn write_raw_message(&self, id: u8, payload: &[u8]) -> Result<(), EngineError> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let frame = self.encoder.encode_frame(id, payload, &mut buf)?;
        self.write_frame(frame)
    }

    /// Write a command without waiting for the device
    pub fn send_command(&self, msg: &dyn Command) -> Result<(), EngineError> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let frame = self.encoder.encode_command(msg, &mut buf)?;
        debug!(id = ?msg.message_id(), channel = ?msg.channel(), "sending command");
        self.write_frame(frame)
    }

    /// Write a command and wait for the device to accept it.
    ///
    /// A zero `timeout` waits forever.
    pub fn send_command_with_timeout(
        &self,
        msg: &dyn Command,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let pending = self
            .shared
            .tracker
            .register(msg.message_id() as u8, msg.channel());
        self.send_command(msg)?;
        let cancel = self.cancel_flag();
        let response = pending.wait(self.policy(timeout, &cancel))?;
        check_response(&response)
    }

    pub fn assign_channel(
        &self,
        channel: u8,
        channel_type: ChannelType,
        network: u8,
    ) -> Result<(), EngineError> {
        self.send_command(&AssignChannel::new(channel, channel_type, network))
    }

    pub fn assign_channel_with_timeout(
        &self,
        channel: u8,
        channel_type: ChannelType,
        network: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&AssignChannel::new(channel, channel_type, network), timeout)
    }

    pub fn unassign_channel(&self, channel: u8) -> Result<(), EngineError> {
        self.send_command(&UnAssignChannel::new(channel))
    }

    pub fn unassign_channel_with_timeout(
        &self,
        channel: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&UnAssignChannel::new(channel), timeout)
    }

    pub fn set_channel_id(
        &self,
        channel: u8,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Result<(), EngineError> {
        self.send_command(&ChannelId::new(
            channel,
            device_number,
            device_type,
            transmission_type,
        ))
    }

    pub fn set_channel_id_with_timeout(
        &self,
        channel: u8,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(
            &ChannelId::new(channel, device_number, device_type, transmission_type),
            timeout,
        )
    }

    pub fn set_channel_period(&self, channel: u8, period: u16) -> Result<(), EngineError> {
        self.send_command(&ChannelPeriod::new(channel, period))
    }

    pub fn set_channel_period_with_timeout(
        &self,
        channel: u8,
        period: u16,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&ChannelPeriod::new(channel, period), timeout)
    }

    /// `search_timeout` counts 2.5 s steps, see
    /// [duration_to_search_timeout](crate::commands::duration_to_search_timeout)
    pub fn set_channel_search_timeout(
        &self,
        channel: u8,
        search_timeout: u8,
    ) -> Result<(), EngineError> {
        self.send_command(&SearchTimeout::new(channel, search_timeout))
    }

    pub fn set_channel_search_timeout_with_timeout(
        &self,
        channel: u8,
        search_timeout: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&SearchTimeout::new(channel, search_timeout), timeout)
    }

    pub fn set_channel_rf_frequency(&self, channel: u8, frequency: u8) -> Result<(), EngineError> {
        self.send_command(&ChannelRfFrequency::new(channel, frequency))
    }

    pub fn set_channel_rf_frequency_with_timeout(
        &self,
        channel: u8,
        frequency: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&ChannelRfFrequency::new(channel, frequency), timeout)
    }

    pub fn set_channel_transmit_power(&self, channel: u8, power: u8) -> Result<(), EngineError> {
        self.send_command(&SetChannelTransmitPower::new(channel, power))
    }

    pub fn set_channel_transmit_power_with_timeout(
        &self,
        channel: u8,
        power: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&SetChannelTransmitPower::new(channel, power), timeout)
    }

    pub fn set_transmit_power(&self, power: u8) -> Result<(), EngineError> {
        self.send_command(&TransmitPower::new(power))
    }

    pub fn set_transmit_power_with_timeout(
        &self,
        power: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&TransmitPower::new(power), timeout)
    }

    pub fn set_network_key(&self, network: u8, key: [u8; 8]) -> Result<(), EngineError> {
        self.send_command(&SetNetworkKey::new(network, key))
    }

    pub fn set_network_key_with_timeout(
        &self,
        network: u8,
        key: [u8; 8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&SetNetworkKey::new(network, key), timeout)
    }

    /// Append the sender's channel id to received data, delivered as `EventRxFlag*` events
    pub fn set_lib_config(
        &self,
        channel_id: bool,
        rssi: bool,
        rx_timestamp: bool,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&LibConfig::new(channel_id, rssi, rx_timestamp), timeout)
    }

    /// Switch on legacy extended data messages (`0x5D`..`0x5F`)
    pub fn enable_extended_messages(
        &self,
        enable: bool,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&EnableExtRxMessages::new(enable), timeout)
    }

    pub fn open_channel(&self, channel: u8) -> Result<(), EngineError> {
        self.send_command(&OpenChannel::new(channel))
    }

    pub fn open_channel_with_timeout(
        &self,
        channel: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&OpenChannel::new(channel), timeout)
    }

    pub fn close_channel(&self, channel: u8) -> Result<(), EngineError> {
        self.send_command(&CloseChannel::new(channel))
    }

    pub fn close_channel_with_timeout(
        &self,
        channel: u8,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.send_command_with_timeout(&CloseChannel::new(channel), timeout)
    }

    pub fn reset_system(&self) -> Result<(), EngineError> {
        self.send_command(&ResetSystem::new())
    }

    /// Reset the device and wait for its startup message, which is returned
    pub fn reset_system_with_timeout(&self, timeout: Duration) -> Result<Message, EngineError> {
        let pending = self
            .shared
            .tracker
            .register(MessageId::StartUpMessage as u8, None);
        self.send_command(&ResetSystem::new())?;
        let cancel = self.cancel_flag();
        Ok(pending.wait(self.policy(timeout, &cancel))?)
    }

    /// Ask the device to send `message_id`, the answer goes to the response handler
    pub fn request_message(&self, channel: u8, message_id: u8) -> Result<(), EngineError> {
        self.send_command(&RequestMessage::new(channel, message_id))
    }

    /// Ask the device to send `message_id` and return it. Fails with [EngineError::Rejected]
    /// as soon as the device refuses the request.
    pub fn request_message_with_timeout(
        &self,
        channel: u8,
        message_id: u8,
        timeout: Duration,
    ) -> Result<Message, EngineError> {
        let scoped =
            MessageId::from_primitive(message_id).is_some_and(MessageId::is_channel_scoped);
        let tracker = &self.shared.tracker;
        let pending = tracker.register(message_id, scoped.then_some(channel));
        let refusal = tracker.register(MessageId::RequestMessage as u8, Some(channel));
        self.send_command(&RequestMessage::new(channel, message_id))?;

        let start = Instant::now();
        let cancel = self.cancel_flag();
        let policy = self.policy(timeout, &cancel);
        let msg = pending.wait_either(&refusal, policy)?;
        if msg.id != MessageId::ChannelEvent as u8 || message_id == MessageId::ChannelEvent as u8 {
            return Ok(msg);
        }
        check_response(&msg)?;
        // Accepted with RESPONSE_NO_ERROR, the requested message is still to come
        drop(refusal);
        Ok(pending.wait(policy.remaining(start)?)?)
    }

    /// Queue one broadcast packet, the device sends it at the next channel period
    pub fn send_broadcast_data(&self, channel: u8, data: [u8; 8]) -> Result<(), EngineError> {
        self.send_command(&BroadcastData::new(channel, data))
    }

    /// Queue one broadcast packet and wait for the channel's next `EVENT_TX`. A master channel
    /// sends its latest data every period, so this confirms the period passed with the packet
    /// loaded rather than delivery to a peer.
    pub fn send_broadcast_data_with_timeout(
        &self,
        channel: u8,
        data: [u8; 8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let cancel = self.cancel_flag();
        let policy = self.policy(timeout, &cancel);
        let transfer = self
            .shared
            .transfer
            .begin(channel, TransferKind::Broadcast, 1, policy)?;
        self.send_command(&BroadcastData::new(channel, data))?;
        transfer.packet_sent();
        finish_transfer(&transfer, channel, policy.remaining(start)?)
    }

    pub fn send_acknowledged_data(&self, channel: u8, data: [u8; 8]) -> Result<(), EngineError> {
        self.send_command(&AcknowledgedData::new(channel, data))
    }

    /// Send one acknowledged packet and wait for the peer's acknowledgement
    pub fn send_acknowledged_data_with_timeout(
        &self,
        channel: u8,
        data: [u8; 8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let cancel = self.cancel_flag();
        let policy = self.policy(timeout, &cancel);
        let transfer = self
            .shared
            .transfer
            .begin(channel, TransferKind::Acknowledged, 1, policy)?;
        self.send_command(&AcknowledgedData::new(channel, data))?;
        transfer.packet_sent();
        finish_transfer(&transfer, channel, policy.remaining(start)?)
    }

    /// Split `data` into burst packets and write them. Writing stops early if the device
    /// reports the transfer failed or the cancel flag is raised.
    pub fn send_burst_transfer(&self, channel: u8, data: &[u8]) -> Result<(), EngineError> {
        let packets = BurstTransferData::packets(channel, data);
        let cancel = self.cancel_flag();
        let policy = self.policy(Duration::ZERO, &cancel);
        let transfer = self
            .shared
            .transfer
            .begin(channel, TransferKind::Burst, packets.len(), policy)?;
        write_burst(self, &transfer, channel, &packets, policy)
    }

    /// Burst `data` and wait until the whole transfer is acknowledged
    pub fn send_burst_transfer_with_timeout(
        &self,
        channel: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let packets = BurstTransferData::packets(channel, data);
        if packets.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let cancel = self.cancel_flag();
        let policy = self.policy(timeout, &cancel);
        let transfer = self
            .shared
            .transfer
            .begin(channel, TransferKind::Burst, packets.len(), policy)?;
        write_burst(self, &transfer, channel, &packets, policy.remaining(start)?)?;
        finish_transfer(&transfer, channel, policy.remaining(start)?)
    }
}

/// Write `packets` one at a time, checking for a device abort and the cancel flag before each
fn write_burst(
    engine: &Engine,
    transfer: &ActiveTransfer<'_>,
    channel: u8,
    packets: &[BurstTransferData],
    policy: WaitPolicy<'_>,
) -> Result<(), EngineError> {
    let start = Instant::now();
    for packet in packets {
        if transfer.aborted() {
            warn!(channel, remaining = transfer.outstanding(), "burst aborted by device");
            return Err(EngineError::TransferFailed { channel });
        }
        if policy.is_cancelled() {
            debug!(channel, remaining = transfer.outstanding(), "burst cancelled");
            return Err(EngineError::Cancelled);
        }
        policy.remaining(start)?;
        engine.send_command(packet)?;
        transfer.packet_sent();
    }
    Ok(())
}

fn finish_transfer(
    transfer: &ActiveTransfer<'_>,
    channel: u8,
    policy: WaitPolicy<'_>,
) -> Result<(), EngineError> {
    match transfer.wait(policy)? {
        TransferOutcome::Completed => Ok(()),
        TransferOutcome::Failed => Err(EngineError::TransferFailed { channel }),
    }
}

/// Turn a channel response into a result
fn check_response(msg: &Message) -> Result<(), EngineError> {
    let code = msg.payload.get(EVENT_CODE_OFFSET).copied().unwrap_or(0);
    if code == u8::from(EventCode::ResponseNoError) {
        return Ok(());
    }
    let message_id = msg.payload.get(RESPONSE_ID_OFFSET).copied().unwrap_or(0);
    debug!(message_id, code, "command rejected");
    Err(EngineError::Rejected { message_id, code })
}

impl Drop for Engine {
    fn drop(&mut self) {
        if thread::current().id() == self.router_id {
            // Joining ourselves would deadlock, the loop exits on its own
            self.shared.request_stop();
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close engine");
        }
    }
}
