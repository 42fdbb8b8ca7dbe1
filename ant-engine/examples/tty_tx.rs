// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

// Master channel on a serial attached radio. Setup is driven entirely from the response handler,
// each accepted command triggers the next one, then every EVENT_TX queues a new broadcast.

use ant_engine::commands::ChannelType;
use ant_engine::{new_shared_buffer, DeviceSelector, Engine, EngineConfig, EventCode, MessageId};
use packed_struct::PrimitiveEnum;
use std::io::BufRead;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CHANNEL: u8 = 0;
const DEVICE_NUMBER: u16 = 49;
const DEVICE_TYPE: u8 = 1;
const TRANSMISSION_TYPE: u8 = 1;
const RF_FREQUENCY: u8 = 35;
const PERIOD: u16 = 8192;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let engine = Arc::new(Engine::init(
        DeviceSelector::Tty(path),
        EngineConfig::default(),
    )?);
    // Handlers only get a weak handle, the engine owns them
    let this: Weak<Engine> = Arc::downgrade(&engine);

    let responses = new_shared_buffer();
    let response_data = responses.clone();
    let setup = this.clone();
    engine.set_response_handler(
        move |channel: u8, message_id: u8| {
            if message_id != MessageId::ChannelEvent as u8 {
                info!(channel, message_id, "device message");
                return true;
            }
            let (command, code) = {
                let buf = response_data.lock().unwrap();
                (buf[1], buf[2])
            };
            let engine = match setup.upgrade() {
                Some(engine) => engine,
                None => return false,
            };
            if code != u8::from(EventCode::ResponseNoError) {
                warn!(channel, command, code, "command rejected");
                return false;
            }
            let next = match MessageId::from_primitive(command) {
                Some(MessageId::AssignChannel) => engine.set_channel_id(
                    channel,
                    DEVICE_NUMBER,
                    DEVICE_TYPE,
                    TRANSMISSION_TYPE,
                ),
                Some(MessageId::ChannelId) => engine.set_channel_rf_frequency(channel, RF_FREQUENCY),
                Some(MessageId::ChannelRfFrequency) => engine.set_channel_period(channel, PERIOD),
                Some(MessageId::ChannelPeriod) => engine.open_channel(channel),
                Some(MessageId::OpenChannel) => {
                    info!(channel, "channel open, transmitting");
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = next {
                warn!(error = %e, "setup step failed");
            }
            true
        },
        responses,
    );

    let counter = Arc::new(AtomicU8::new(0));
    let tx = this.clone();
    engine.set_channel_handler(
        CHANNEL,
        move |channel: u8, event: u8| {
            if event != u8::from(EventCode::EventTx) {
                info!(channel, event, "channel event");
                return true;
            }
            let count = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(engine) = tx.upgrade() {
                if let Err(e) = engine.send_broadcast_data(channel, [0, 0, 0, 0, 0, 0, 0, count]) {
                    warn!(error = %e, "broadcast failed");
                }
            }
            true
        },
        new_shared_buffer(),
    );

    engine.assign_channel(CHANNEL, ChannelType::BidirectionalMaster, 0)?;

    println!("Transmitting, press enter to stop");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    engine.close_channel(CHANNEL)?;
    engine.close()?;
    Ok(())
}
