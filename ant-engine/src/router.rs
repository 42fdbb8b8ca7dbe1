// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::dispatch::DispatchTable;
use crate::framer::Framer;
use crate::message::{
    EventCode, Message, MessageId, CHANNEL_NUMBER_MASK, CHANNEL_OFFSET, EVENT_CODE_OFFSET,
    EXTENDED_DATA_SIZE, MAX_FRAME_SIZE, RESPONSE_ID_OFFSET, RESPONSE_IS_EVENT, STANDARD_DATA_SIZE,
};
use crate::tracker::{RequestTracker, TransferMonitor};
use crate::transport::Transport;
use packed_struct::PrimitiveEnum;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

pub const ROUTER_THREAD_NAME: &str = "ant-router";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    Running,
    /// Stop was requested, the loop exits within one poll interval
    Stopping,
    Stopped,
}

/// Where an inbound message goes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Reply to a command we sent, `message_id` is the id of that command
    Response { channel: u8, message_id: u8 },
    /// RF or transfer event on a channel
    ChannelEvent { channel: u8, code: u8 },
    /// Received data, the first `len` payload bytes go to the channel buffer
    Data {
        channel: u8,
        event: EventCode,
        len: usize,
    },
    /// Requested responses and notifications
    Other { channel: u8, message_id: u8 },
}

/// Plain and flagged event for a standard data message
fn data_events(id: MessageId) -> Option<(EventCode, EventCode)> {
    match id {
        MessageId::BroadcastData => Some((
            EventCode::EventRxBroadcast,
            EventCode::EventRxFlagBroadcast,
        )),
        MessageId::AcknowledgedData => Some((
            EventCode::EventRxAcknowledged,
            EventCode::EventRxFlagAcknowledged,
        )),
        MessageId::BurstTransferData => Some((
            EventCode::EventRxBurstPacket,
            EventCode::EventRxFlagBurstPacket,
        )),
        _ => None,
    }
}

/// Decide where `msg` goes. Empty messages carry nothing to route.
pub fn classify(msg: &Message) -> Option<Route> {
    let payload = msg.payload.as_slice();
    let channel = payload.get(CHANNEL_OFFSET)? & CHANNEL_NUMBER_MASK;
    let size = payload.len();

    let id = match msg.message_id() {
        Some(id) => id,
        None => {
            return Some(Route::Other {
                channel,
                message_id: msg.id,
            })
        }
    };

    if id == MessageId::ChannelEvent {
        let response_id = payload.get(RESPONSE_ID_OFFSET).copied().unwrap_or(0);
        let code = payload.get(EVENT_CODE_OFFSET).copied().unwrap_or(0);
        return Some(if response_id == RESPONSE_IS_EVENT {
            Route::ChannelEvent { channel, code }
        } else {
            Route::Response {
                channel,
                message_id: response_id,
            }
        });
    }

    if let Some((plain, flagged)) = data_events(id) {
        return Some(if size > STANDARD_DATA_SIZE {
            Route::Data {
                channel,
                event: flagged,
                len: size,
            }
        } else {
            Route::Data {
                channel,
                event: plain,
                len: size,
            }
        });
    }

    let extended = match id {
        MessageId::ExtendedBroadcastData => Some(EventCode::EventRxExtBroadcast),
        MessageId::ExtendedAcknowledgedData => Some(EventCode::EventRxExtAcknowledged),
        MessageId::ExtendedBurstData => Some(EventCode::EventRxExtBurstPacket),
        _ => None,
    };
    if let Some(event) = extended {
        return Some(Route::Data {
            channel,
            event,
            len: size.min(EXTENDED_DATA_SIZE),
        });
    }

    if id == MessageId::AdvancedBurstData {
        return Some(Route::Data {
            channel,
            event: EventCode::EventRxBurstPacket,
            len: size,
        });
    }

    Some(Route::Other {
        channel,
        message_id: msg.id,
    })
}

/// State the router thread shares with the engine
pub(crate) struct Shared {
    pub table: Mutex<DispatchTable>,
    pub tracker: RequestTracker,
    pub transfer: TransferMonitor,
    state: Mutex<RouterState>,
    state_cond: Condvar,
    stop: AtomicBool,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(DispatchTable::new()),
            tracker: RequestTracker::new(),
            transfer: TransferMonitor::new(),
            state: Mutex::new(RouterState::Running),
            state_cond: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> MutexGuard<'_, DispatchTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RouterState {
        *self.lock_state()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let mut state = self.lock_state();
        if *state == RouterState::Running {
            *state = RouterState::Stopping;
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn mark_stopped(&self) {
        *self.lock_state() = RouterState::Stopped;
        self.state_cond.notify_all();
        self.tracker.close();
        self.transfer.close();
    }

    /// Block until the router loop has exited
    pub fn wait_stopped(&self) {
        let mut state = self.lock_state();
        while *state != RouterState::Stopped {
            state = self
                .state_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Sets [RouterState::Stopped] however the loop exits
struct StoppedGuard<'a>(&'a Shared);

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

/// Hand `msg` to whoever wants it
pub(crate) fn route(shared: &Shared, msg: &Message) {
    let route = match classify(msg) {
        Some(route) => route,
        None => {
            trace!(id = msg.id, "ignoring empty message");
            return;
        }
    };

    match route {
        Route::Response {
            channel,
            message_id,
        } => {
            if !shared.tracker.offer(message_id, channel, msg) {
                deliver_response(shared, channel, MessageId::ChannelEvent as u8, msg);
            }
        }
        Route::ChannelEvent { channel, code } => {
            shared.transfer.on_event(channel, code);
            deliver_channel(shared, channel, code, &msg.payload);
        }
        Route::Data {
            channel,
            event,
            len,
        } => deliver_channel(shared, channel, event.into(), &msg.payload[..len]),
        Route::Other {
            channel,
            message_id,
        } => {
            if !shared.tracker.offer(message_id, channel, msg) {
                deliver_response(shared, channel, message_id, msg);
            }
        }
    }
}

fn deliver_channel(shared: &Shared, channel: u8, event: u8, data: &[u8]) {
    // Clone the slot out so the handler can touch the table
    let slot = shared.table().lookup(channel).cloned();
    match slot {
        Some(slot) => {
            slot.deliver(channel, event, data);
        }
        None => trace!(channel, event, "no channel handler"),
    }
}

fn deliver_response(shared: &Shared, channel: u8, message_id: u8, msg: &Message) {
    let slot = shared.table().response().cloned();
    match slot {
        Some(slot) => {
            slot.deliver(channel, message_id, &msg.payload);
        }
        None => trace!(
            channel,
            message_id,
            known = MessageId::from_primitive(message_id).is_some(),
            "no response handler"
        ),
    }
}

/// Reads the transport, deframes and routes until asked to stop
pub(crate) struct Router {
    transport: Arc<dyn Transport>,
    framer: Framer,
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl Router {
    pub fn new(
        transport: Arc<dyn Transport>,
        framer: Framer,
        shared: Arc<Shared>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            framer,
            shared,
            poll_interval,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(ROUTER_THREAD_NAME.into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        let shared = self.shared.clone();
        let _stopped = StoppedGuard(&shared);
        let mut buf = [0u8; MAX_FRAME_SIZE];
        debug!("router started");
        while !shared.should_stop() {
            match self.transport.read(&mut buf, self.poll_interval) {
                Ok(0) => continue,
                Ok(n) => self.process(&buf[..n]),
                Err(e) => {
                    error!(error = %e, "transport read failed, stopping router");
                    break;
                }
            }
        }
        debug!("router stopped");
    }

    /// Push freshly read bytes and route every complete message
    fn process(&mut self, bytes: &[u8]) {
        self.framer.push(bytes);
        loop {
            match self.framer.get_message() {
                Ok(Some(msg)) => route(&self.shared, &msg),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    // Absorbs the rejected frame, always Ok(None)
                    let _ = self.framer.get_message();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{new_shared_buffer, ChannelHandler, ResponseHandler};
    use crate::message::ChannelIdOutput;
    use crate::tracker::{TransferKind, TransferOutcome, WaitPolicy};
    use std::sync::atomic::AtomicU8;

    fn msg(id: u8, payload: &[u8]) -> Message {
        Message::new(id, payload).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<(u8, u8)>>>, Arc<dyn ChannelHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        let handler: Arc<dyn ChannelHandler> = Arc::new(move |chan: u8, event: u8| {
            inner.lock().unwrap().push((chan, event));
            true
        });
        (seen, handler)
    }

    #[test]
    fn classify_response_and_event() {
        assert_eq!(
            classify(&msg(0x40, &[1, 0x42, 0])),
            Some(Route::Response {
                channel: 1,
                message_id: 0x42
            })
        );
        assert_eq!(
            classify(&msg(0x40, &[2, 1, 0x03])),
            Some(Route::ChannelEvent {
                channel: 2,
                code: 0x03
            })
        );
        assert_eq!(classify(&msg(0x40, &[])), None);
    }

    #[test]
    fn classify_data() {
        let standard = msg(0x4E, &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            classify(&standard),
            Some(Route::Data {
                channel: 0,
                event: EventCode::EventRxBroadcast,
                len: 9
            })
        );
        let flagged = msg(0x4F, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 0x80, 0x31, 0, 1, 1]);
        assert_eq!(
            classify(&flagged),
            Some(Route::Data {
                channel: 0,
                event: EventCode::EventRxFlagAcknowledged,
                len: 14
            })
        );
        let burst = msg(0x50, &[0x63, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            classify(&burst),
            Some(Route::Data {
                channel: 3,
                event: EventCode::EventRxBurstPacket,
                len: 9
            })
        );
        let extended = msg(0x5D, &[4, 0x31, 0, 1, 1, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            classify(&extended),
            Some(Route::Data {
                channel: 4,
                event: EventCode::EventRxExtBroadcast,
                len: 13
            })
        );
        let advanced = msg(0x72, &[0x25; 25]);
        assert_eq!(
            classify(&advanced),
            Some(Route::Data {
                channel: 5,
                event: EventCode::EventRxBurstPacket,
                len: 25
            })
        );
    }

    #[test]
    fn classify_other() {
        assert_eq!(
            classify(&msg(0x52, &[3, 0x23])),
            Some(Route::Other {
                channel: 3,
                message_id: 0x52
            })
        );
        assert_eq!(
            classify(&msg(0xEE, &[0])),
            Some(Route::Other {
                channel: 0,
                message_id: 0xEE
            })
        );
    }

    #[test]
    fn standard_broadcast_lands_in_buffer() {
        let shared = Shared::new();
        let (seen, handler) = recorder();
        let buffer = new_shared_buffer();
        shared.table().assign(0, handler, buffer.clone());

        route(&shared, &msg(0x4E, &[0, 1, 2, 3, 4, 5, 6, 7, 8]));

        assert_eq!(*seen.lock().unwrap(), [(0, 0x9A)]);
        let buf = buffer.lock().unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..9], [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn flagged_broadcast_keeps_channel_id() {
        let shared = Shared::new();
        let (seen, handler) = recorder();
        let buffer = new_shared_buffer();
        shared.table().assign(0, handler, buffer.clone());

        route(
            &shared,
            &msg(0x4E, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 0x80, 0x31, 0x00, 0x01, 0x01]),
        );

        assert_eq!(*seen.lock().unwrap(), [(0, 0x7F)]);
        let id = ChannelIdOutput::from_flagged(&buffer.lock().unwrap()).unwrap();
        assert_eq!(id.device_number, 49);
        assert_eq!(id.device_type, 1);
        assert_eq!(id.transmission_type, 1);
    }

    #[test]
    fn unregistered_channel_is_dropped() {
        let shared = Shared::new();
        let (seen, handler) = recorder();
        shared.table().assign(1, handler, new_shared_buffer());
        route(&shared, &msg(0x4E, &[2, 1, 2, 3, 4, 5, 6, 7, 8]));
        route(&shared, &msg(0x40, &[7, 1, 0x03]));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unclaimed_response_goes_to_response_slot() {
        let shared = Shared::new();
        let seen = Arc::new(AtomicU8::new(0));
        let inner = seen.clone();
        let handler: Arc<dyn ResponseHandler> = Arc::new(move |_: u8, id: u8| {
            inner.store(id, Ordering::SeqCst);
            true
        });
        let buffer = new_shared_buffer();
        shared.table().set_response(handler, buffer.clone());

        route(&shared, &msg(0x40, &[0, 0x42, 0]));
        assert_eq!(seen.load(Ordering::SeqCst), 0x40);
        assert_eq!(buffer.lock().unwrap().as_slice(), [0, 0x42, 0]);

        route(&shared, &msg(0x3E, b"AJK1.04RAF\0"));
        assert_eq!(seen.load(Ordering::SeqCst), 0x3E);
    }

    #[test]
    fn claimed_response_skips_handler() {
        let shared = Shared::new();
        let seen = Arc::new(AtomicU8::new(0));
        let inner = seen.clone();
        let handler: Arc<dyn ResponseHandler> = Arc::new(move |_: u8, id: u8| {
            inner.store(id, Ordering::SeqCst);
            true
        });
        shared.table().set_response(handler, new_shared_buffer());

        let pending = shared.tracker.register(0x42, Some(0));
        route(&shared, &msg(0x40, &[0, 0x42, 0]));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        let response = pending
            .wait(WaitPolicy {
                timeout: Duration::from_millis(10),
                cancel: None,
                cancel_poll: Duration::from_millis(10),
            })
            .unwrap();
        assert_eq!(response.payload[2], 0);
    }

    #[test]
    fn burst_abort_on_tx_failed() {
        let shared = Shared::new();
        let (seen, handler) = recorder();
        shared.table().assign(0, handler, new_shared_buffer());

        let transfer = shared
            .transfer
            .begin(
                0,
                TransferKind::Burst,
                3,
                WaitPolicy {
                    timeout: Duration::ZERO,
                    cancel: None,
                    cancel_poll: Duration::from_millis(10),
                },
            )
            .unwrap();
        transfer.packet_sent();
        route(&shared, &msg(0x40, &[0, 1, 0x06]));

        assert!(transfer.aborted());
        assert_eq!(transfer.outstanding(), 0);
        assert_eq!(
            transfer.wait(WaitPolicy {
                timeout: Duration::from_millis(10),
                cancel: None,
                cancel_poll: Duration::from_millis(10),
            }),
            Ok(TransferOutcome::Failed)
        );
        // The application still sees the event
        assert_eq!(*seen.lock().unwrap(), [(0, 0x06)]);
    }

    #[test]
    fn handler_can_reregister() {
        let shared = Arc::new(Shared::new());
        let inner = shared.clone();
        let handler: Arc<dyn ChannelHandler> = Arc::new(move |_: u8, _: u8| {
            inner.table().unassign(0);
            true
        });
        shared.table().assign(0, handler, new_shared_buffer());
        route(&shared, &msg(0x40, &[0, 1, 0x07]));
        assert!(shared.table().lookup(0).is_none());
    }

    #[test]
    fn stop_state_transitions() {
        let shared = Shared::new();
        assert_eq!(shared.state(), RouterState::Running);
        shared.request_stop();
        assert_eq!(shared.state(), RouterState::Stopping);
        shared.mark_stopped();
        shared.wait_stopped();
        assert_eq!(shared.state(), RouterState::Stopped);
    }
}
