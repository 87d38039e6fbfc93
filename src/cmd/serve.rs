use anyhow::{Context, Result};
use clap::{ArgMatches, Command};
use log::info;
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::mpsc,
};

use textbeam::{
    bridge::JsonLineBridge,
    gatt::{AdvertiseParams, GattServerCore, ServiceDefinition, SERVICE_UUID},
    radio::bluez::{AdapterGate, BluezRadio},
};

use super::CmdData;

pub fn subcmd<'help>() -> Command<'help> {
    Command::new("serve").about("Run the text exchange peripheral")
}

/// Run the peripheral: received text goes to stdout as JSON lines, lines
/// read from stdin are sent out as notifications.
pub async fn cmd(data: &mut CmdData, _arg: &ArgMatches) -> Result<()> {
    let (event_tx, mut events) = mpsc::channel(16);

    let radio = BluezRadio::new(&data.name, event_tx)
        .await
        .context("failed to acquire bluetooth adapter")?;
    let gate = AdapterGate::new(radio.adapter());

    let service = ServiceDefinition::text_exchange();
    let advertise = AdvertiseParams::low_latency(SERVICE_UUID, data.name.clone());

    let mut server = GattServerCore::new(service, advertise, radio, JsonLineBridge, gate);
    server.start().await.context("failed to start gatt server")?;

    let mut lines = BufReader::new(stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => server.handle_event(event).await,
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if data.verbose {
                        info!("sending {} bytes to {} devices", line.len(), server.registry().len());
                    }
                    server.send(&line).await;
                }
                None => break,
            },
        }
    }

    server.stop().await;
    Ok(())
}
