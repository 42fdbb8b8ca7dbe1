// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

// Wildcard slave channel on an ANT USB stick. Events are pulled off a queue on the main thread.

use ant_engine::commands::ChannelType;
use ant_engine::message::ChannelIdOutput;
use ant_engine::transport::is_ant_usb_device_from_device;
use ant_engine::{DeviceSelector, Engine, EngineConfig, EventCode, MessageId};
use dialoguer::Select;
use rusb::{Device, DeviceList};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHANNEL: u8 = 0;
const TIMEOUT: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let devices: Vec<Device<_>> = DeviceList::new()?
        .iter()
        .filter(|x| is_ant_usb_device_from_device(x))
        .collect();

    if devices.is_empty() {
        return Err("No devices found".into());
    }

    let index = if devices.len() == 1 {
        0
    } else {
        Select::new()
            .with_prompt("Multiple devices found, please select a radio to use.")
            .items(
                &devices
                    .iter()
                    .filter_map(|x| x.device_descriptor().ok())
                    .map(|x| format!("{:04x}:{:04x}", x.vendor_id(), x.product_id()))
                    .collect::<Vec<String>>(),
            )
            .interact()?
    };

    let engine = Engine::init(DeviceSelector::Usb(index), EngineConfig::default())?;
    let startup = engine.reset_system_with_timeout(Duration::from_secs(2))?;
    info!(reason = startup.payload.first().copied(), "device reset");

    let capabilities = engine.request_message_with_timeout(
        0,
        MessageId::Capabilities as u8,
        TIMEOUT,
    )?;
    info!(max_channels = capabilities.payload[0], "capabilities");

    let events = engine.queue_channel_events(CHANNEL, 32);
    engine.assign_channel_with_timeout(CHANNEL, ChannelType::BidirectionalSlave, 0, TIMEOUT)?;
    engine.set_channel_id_with_timeout(CHANNEL, 0, 0, 0, TIMEOUT)?;
    engine.set_channel_rf_frequency_with_timeout(CHANNEL, 66, TIMEOUT)?;
    engine.set_lib_config(true, false, false, TIMEOUT)?;
    engine.open_channel_with_timeout(CHANNEL, TIMEOUT)?;
    info!("searching");

    while let Some(event) = events.recv() {
        match event.event_code() {
            Some(EventCode::EventRxBroadcast) => println!("Data: {:?}", &event.data[1..]),
            Some(EventCode::EventRxFlagBroadcast) => {
                let sender = ChannelIdOutput::from_flagged(&event.data);
                println!("Data: {:?} from {:?}", &event.data[1..9], sender);
            }
            Some(EventCode::EventRxSearchTimeout) | Some(EventCode::EventChannelClosed) => {
                println!("Search ended");
                break;
            }
            code => info!(?code, "channel event"),
        }
    }

    engine.close()?;
    Ok(())
}
