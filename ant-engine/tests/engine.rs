// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use ant_engine::commands::ChannelType;
use ant_engine::framer::calculate_checksum;
use ant_engine::message::ChannelIdOutput;
use ant_engine::transport::{Transport, TransportError};
use ant_engine::{
    new_shared_buffer, status_of, Engine, EngineConfig, EngineError, EventCode, ResponseStatus,
    RouterState,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

type Responder = Box<dyn Fn(u8, &[u8]) -> Vec<Vec<u8>> + Send + Sync>;

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0xA4, payload.len() as u8, id];
    out.extend_from_slice(payload);
    out.push(calculate_checksum(&out));
    out
}

/// In memory device, answers every written frame through `responder`
struct ScriptedDevice {
    inbound: Mutex<VecDeque<u8>>,
    ready: Condvar,
    written: Mutex<Vec<Vec<u8>>>,
    responder: Responder,
    closed: AtomicBool,
}

impl ScriptedDevice {
    fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            written: Mutex::new(Vec::new()),
            responder,
            closed: AtomicBool::new(false),
        })
    }

    /// Accepts every command
    fn accepting() -> Arc<Self> {
        Self::new(Box::new(|id: u8, payload: &[u8]| {
            vec![frame(0x40, &[payload.first().copied().unwrap_or(0), id, 0])]
        }))
    }

    fn silent() -> Arc<Self> {
        Self::new(Box::new(|_: u8, _: &[u8]| vec![]))
    }

    fn inject(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes);
        self.ready.notify_all();
    }

    fn written_ids(&self) -> Vec<u8> {
        self.written.lock().unwrap().iter().map(|f| f[2]).collect()
    }
}

impl Transport for ScriptedDevice {
    fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.written.lock().unwrap().push(bytes.to_vec());
        let id = bytes[2];
        let payload = &bytes[3..bytes.len() - 1];
        for reply in (self.responder)(id, payload) {
            self.inject(&reply);
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_empty() {
            inbound = self.ready.wait_timeout(inbound, timeout).unwrap().0;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let n = inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

fn config() -> EngineConfig {
    EngineConfig::default().with_poll_interval(Duration::from_millis(10))
}

fn start(device: &Arc<ScriptedDevice>) -> Engine {
    Engine::with_transport(device.clone(), config()).unwrap()
}

type Events = Arc<Mutex<Vec<(u8, u8, Vec<u8>)>>>;

fn watch_channel(engine: &Engine, channel: u8) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let buffer = new_shared_buffer();
    let data = buffer.clone();
    let sink = events.clone();
    engine.set_channel_handler(
        channel,
        move |chan: u8, event: u8| {
            let bytes = data.lock().unwrap().to_vec();
            sink.lock().unwrap().push((chan, event, bytes));
            true
        },
        buffer,
    );
    events
}

fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

const TIMEOUT: Duration = Duration::from_millis(500);

#[test]
fn open_channel_sequence_then_tx_event() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| {
        let channel = payload[0];
        let mut replies = vec![frame(0x40, &[channel, id, 0])];
        if id == 0x4B {
            replies.push(frame(0x40, &[channel, 1, 0x03]));
        }
        replies
    }));
    let engine = start(&device);
    let events = watch_channel(&engine, 0);

    engine
        .assign_channel_with_timeout(0, ChannelType::BidirectionalMaster, 0, TIMEOUT)
        .unwrap();
    engine
        .set_channel_id_with_timeout(0, 49, 1, 1, TIMEOUT)
        .unwrap();
    engine
        .set_channel_rf_frequency_with_timeout(0, 35, TIMEOUT)
        .unwrap();
    engine.open_channel_with_timeout(0, TIMEOUT).unwrap();

    assert!(wait_for(|| !events.lock().unwrap().is_empty()));
    let events = events.lock().unwrap();
    assert_eq!(events[0].0, 0);
    assert_eq!(events[0].1, u8::from(EventCode::EventTx));

    {
        let written = device.written.lock().unwrap();
        assert_eq!(written[0], [0xA4, 3, 0x42, 0, 0x10, 0, 0xF5]);
        assert_eq!(&written[1][3..8], [0, 49, 0, 1, 1]);
        assert_eq!(&written[2][3..5], [0, 35]);
    }
    assert_eq!(device.written_ids(), [0x42, 0x51, 0x45, 0x4B]);
}

#[test]
fn timeout_is_bounded() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let start = Instant::now();
    let result = engine.open_channel_with_timeout(0, Duration::from_millis(100));
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(EngineError::Timeout)));
    assert_eq!(status_of(&result), ResponseStatus::Timeout);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(400));
}

#[test]
fn cancel_flag_aborts_wait() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let cancel = Arc::new(AtomicBool::new(false));
    engine.set_cancel_flag(Some(cancel.clone()));

    let setter = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.store(true, Ordering::SeqCst);
        })
    };
    let start = Instant::now();
    let result = engine.open_channel_with_timeout(0, Duration::ZERO);
    setter.join().unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(status_of(&result), ResponseStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(1));

    engine.set_cancel_flag(None);
    assert!(matches!(
        engine.open_channel_with_timeout(0, Duration::from_millis(20)),
        Err(EngineError::Timeout)
    ));
}

#[test]
fn concurrent_requests_from_two_threads() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| {
        // Slow enough that both requests are in flight together
        thread::sleep(Duration::from_millis(20));
        vec![frame(0x40, &[payload[0], id, 0])]
    }));
    let engine = Arc::new(start(&device));
    let handles: Vec<_> = (0..2u8)
        .map(|channel| {
            let engine = engine.clone();
            thread::spawn(move || {
                engine.assign_channel_with_timeout(
                    channel,
                    ChannelType::BidirectionalSlave,
                    0,
                    Duration::from_secs(2),
                )?;
                engine.set_channel_period_with_timeout(channel, 8070, Duration::from_secs(2))
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(device.written.lock().unwrap().len(), 4);
}

#[test]
fn rejected_command() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| {
        vec![frame(0x40, &[payload[0], id, 0x15])]
    }));
    let engine = start(&device);
    let result = engine.open_channel_with_timeout(2, TIMEOUT);
    let err = result.as_ref().unwrap_err();
    assert!(matches!(
        err,
        EngineError::Rejected {
            message_id: 0x4B,
            code: 0x15
        }
    ));
    assert_eq!(err.rejection_code(), Some(EventCode::ChannelInWrongState));
    assert_eq!(status_of(&result), ResponseStatus::Fail);
}

#[test]
fn close_from_router_thread_is_refused() {
    let device = ScriptedDevice::silent();
    let engine = Arc::new(start(&device));
    let weak: Weak<Engine> = Arc::downgrade(&engine);
    let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let sink = outcome.clone();
    engine.set_channel_handler(
        0,
        move |_: u8, _: u8| {
            if let Some(engine) = weak.upgrade() {
                let refused = matches!(engine.close(), Err(EngineError::CloseFromRouterThread));
                *sink.lock().unwrap() = Some(refused);
            }
            true
        },
        new_shared_buffer(),
    );

    device.inject(&frame(0x40, &[0, 1, 0x07]));
    assert!(wait_for(|| outcome.lock().unwrap().is_some()));
    assert_eq!(*outcome.lock().unwrap(), Some(true));
    assert_eq!(engine.state(), RouterState::Running);

    engine.close().unwrap();
    assert_eq!(engine.state(), RouterState::Stopped);
}

#[test]
fn close_is_idempotent_and_stops_writes() {
    let device = ScriptedDevice::accepting();
    let engine = start(&device);
    engine.close().unwrap();
    engine.close().unwrap();
    assert_eq!(engine.state(), RouterState::Stopped);
    assert!(device.closed.load(Ordering::SeqCst));
    assert!(matches!(engine.open_channel(0), Err(EngineError::Closed)));
}

#[test]
fn raw_message_is_framed() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    engine.write_raw_message(0x4D, &[0, 0x54]).unwrap();
    let written = device.written.lock().unwrap();
    let expected = calculate_checksum(&[0xA4, 2, 0x4D, 0, 0x54]);
    assert_eq!(written[0], [0xA4, 2, 0x4D, 0, 0x54, expected]);
    drop(written);

    assert!(matches!(
        engine.write_raw_message(0x4E, &[0; 42]),
        Err(EngineError::Framing(_))
    ));
}

#[test]
fn broadcast_after_corrupt_frame() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let events = watch_channel(&engine, 1);

    let mut corrupt = frame(0x4E, &[1, 9, 9, 9, 9, 9, 9, 9, 9]);
    *corrupt.last_mut().unwrap() ^= 0xFF;
    let mut stream = vec![0x00, 0x13];
    stream.extend(corrupt);
    stream.extend(frame(0x4E, &[1, 1, 2, 3, 4, 5, 6, 7, 8]));
    device.inject(&stream);

    assert!(wait_for(|| !events.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(30));
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (channel, event, data) = &events[0];
    assert_eq!(*channel, 1);
    assert_eq!(*event, u8::from(EventCode::EventRxBroadcast));
    assert_eq!(data[0], 1);
    assert_eq!(&data[1..9], [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn flagged_broadcast_reports_sender() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let events = watch_channel(&engine, 0);
    device.inject(&frame(
        0x4E,
        &[0, 1, 2, 3, 4, 5, 6, 7, 8, 0x80, 0x31, 0x00, 0x01, 0x01],
    ));
    assert!(wait_for(|| !events.lock().unwrap().is_empty()));
    let events = events.lock().unwrap();
    assert_eq!(events[0].1, u8::from(EventCode::EventRxFlagBroadcast));
    let id = ChannelIdOutput::from_flagged(&events[0].2).unwrap();
    assert_eq!(
        (id.device_number, id.device_type, id.transmission_type),
        (49, 1, 1)
    );
}

#[test]
fn request_capabilities() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match (id, payload) {
        (0x4D, [_, 0x54]) => vec![frame(0x54, &[8, 3, 0, 0x3A, 0, 0])],
        _ => vec![],
    }));
    let engine = start(&device);
    let msg = engine.request_message_with_timeout(0, 0x54, TIMEOUT).unwrap();
    assert_eq!(msg.id, 0x54);
    assert_eq!(msg.payload[0], 8);
}

#[test]
fn refused_request_fails_fast() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        0x4D => vec![frame(0x40, &[payload[0], 0x4D, 0x28])],
        _ => vec![],
    }));
    let engine = start(&device);
    let start = Instant::now();
    let result = engine.request_message_with_timeout(1, 0x61, Duration::from_secs(2));
    assert!(matches!(
        result,
        Err(EngineError::Rejected {
            message_id: 0x4D,
            code: 0x28
        })
    ));
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn accepted_request_still_waits_for_answer() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        0x4D => vec![
            frame(0x40, &[payload[0], 0x4D, 0]),
            frame(0x3E, b"AJK1.04RAF\0"),
        ],
        _ => vec![],
    }));
    let engine = start(&device);
    let msg = engine.request_message_with_timeout(0, 0x3E, TIMEOUT).unwrap();
    assert_eq!(msg.id, 0x3E);
}

#[test]
fn request_channel_status_matches_channel() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match (id, payload) {
        // Another channel's status shows up first and must not satisfy the request
        (0x4D, [channel, 0x52]) => vec![
            frame(0x52, &[channel + 1, 0x01]),
            frame(0x52, &[*channel, 0x03]),
        ],
        _ => vec![],
    }));
    let engine = start(&device);
    let msg = engine.request_message_with_timeout(2, 0x52, TIMEOUT).unwrap();
    assert_eq!(msg.payload.as_slice(), [2, 0x03]);
}

#[test]
fn unclaimed_messages_reach_response_handler() {
    let device = ScriptedDevice::accepting();
    let engine = start(&device);
    let seen: Arc<Mutex<Vec<(u8, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.set_response_handler(
        move |channel: u8, id: u8| {
            sink.lock().unwrap().push((channel, id));
            true
        },
        new_shared_buffer(),
    );
    engine.open_channel(3).unwrap();
    device.inject(&frame(0x3E, b"AJK1.04RAF\0"));
    assert!(wait_for(|| seen.lock().unwrap().len() == 2));
    assert_eq!(*seen.lock().unwrap(), [(3, 0x40), (b'A' & 0x1F, 0x3E)]);

    engine.clear_all_handlers();
    engine.open_channel(3).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn reset_waits_for_startup() {
    let device = ScriptedDevice::new(Box::new(|id: u8, _: &[u8]| match id {
        0x4A => vec![frame(0x6F, &[0x20])],
        _ => vec![],
    }));
    let engine = start(&device);
    let startup = engine.reset_system_with_timeout(TIMEOUT).unwrap();
    assert_eq!(startup.payload.as_slice(), [0x20]);
}

#[test]
fn acknowledged_data_completes() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        0x4F => vec![frame(0x40, &[payload[0], 1, 0x05])],
        _ => vec![],
    }));
    let engine = start(&device);
    engine
        .send_acknowledged_data_with_timeout(0, [1, 2, 3, 4, 5, 6, 7, 8], TIMEOUT)
        .unwrap();
}

#[test]
fn broadcast_waits_for_event_tx() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        0x4E => vec![frame(0x40, &[payload[0], 1, 0x03])],
        _ => vec![],
    }));
    let engine = start(&device);
    engine
        .send_broadcast_data_with_timeout(4, [0; 8], TIMEOUT)
        .unwrap();
}

#[test]
fn burst_failure_is_reported() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        // Fail as soon as the first packet arrives
        0x50 if payload[0] & 0xE0 == 0 => vec![frame(0x40, &[payload[0] & 0x1F, 1, 0x06])],
        _ => vec![],
    }));
    let engine = start(&device);
    let result = engine.send_burst_transfer_with_timeout(0, &[7u8; 40], TIMEOUT);
    assert!(matches!(
        result,
        Err(EngineError::TransferFailed { channel: 0 })
    ));
    let bursts = device
        .written_ids()
        .into_iter()
        .filter(|id| *id == 0x50)
        .count();
    assert!((1..=5).contains(&bursts));
}

#[test]
fn cancel_interrupts_burst() {
    let device = ScriptedDevice::new(Box::new(|id: u8, _: &[u8]| {
        if id == 0x50 {
            thread::sleep(Duration::from_millis(5));
        }
        vec![]
    }));
    let engine = start(&device);
    let cancel = Arc::new(AtomicBool::new(false));
    engine.set_cancel_flag(Some(cancel.clone()));
    let setter = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.store(true, Ordering::SeqCst);
        })
    };

    let start = Instant::now();
    let result =
        engine.send_burst_transfer_with_timeout(0, &[3u8; 800], Duration::from_secs(5));
    setter.join().unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(start.elapsed() < Duration::from_millis(300));
    let bursts = device
        .written_ids()
        .into_iter()
        .filter(|id| *id == 0x50)
        .count();
    assert!(bursts < 50, "{} packets written after cancel", bursts);
}

#[test]
fn second_transfer_times_out_while_first_runs() {
    let device = ScriptedDevice::silent();
    let engine = Arc::new(start(&device));
    let first = {
        let engine = engine.clone();
        thread::spawn(move || {
            engine.send_acknowledged_data_with_timeout(0, [1; 8], Duration::from_millis(1500))
        })
    };
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    let result =
        engine.send_acknowledged_data_with_timeout(1, [2; 8], Duration::from_millis(50));
    assert!(matches!(result, Err(EngineError::Timeout)));
    assert!(start.elapsed() < Duration::from_millis(400));
    assert!(matches!(first.join().unwrap(), Err(EngineError::Timeout)));
}

#[test]
fn burst_completes() {
    let device = ScriptedDevice::new(Box::new(|id: u8, payload: &[u8]| match id {
        0x50 if payload[0] & 0x80 != 0 => vec![frame(0x40, &[payload[0] & 0x1F, 1, 0x05])],
        _ => vec![],
    }));
    let engine = start(&device);
    engine
        .send_burst_transfer_with_timeout(1, &[1u8; 20], TIMEOUT)
        .unwrap();
    let written = device.written.lock().unwrap();
    let sequences: Vec<u8> = written.iter().map(|f| f[3]).collect();
    assert_eq!(sequences, [0x01, 0x21, 0xC1]);
}

#[test]
fn queued_events_leave_the_router_thread() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let events = engine.queue_channel_events(2, 8);
    device.inject(&frame(0x4E, &[2, 8, 7, 6, 5, 4, 3, 2, 1]));
    device.inject(&frame(0x40, &[2, 1, 0x07]));

    let first = events.recv().unwrap();
    assert_eq!(first.event_code(), Some(EventCode::EventRxBroadcast));
    assert_eq!(&first.data[1..9], [8, 7, 6, 5, 4, 3, 2, 1]);
    let second = events.recv().unwrap();
    assert_eq!(second.event_code(), Some(EventCode::EventChannelClosed));
}

#[test]
fn zero_capacity_queue_still_delivers() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    let events = engine.queue_channel_events(0, 0);
    device.inject(&frame(0x40, &[0, 1, 0x03]));
    let event = events.recv().unwrap();
    assert_eq!(event.event_code(), Some(EventCode::EventTx));
}

#[test]
fn transport_failure_stops_router() {
    let device = ScriptedDevice::silent();
    let engine = start(&device);
    device.close();
    assert!(wait_for(|| engine.state() == RouterState::Stopped));
    assert!(matches!(
        engine.open_channel_with_timeout(0, TIMEOUT),
        Err(EngineError::Closed)
    ));
}
