//! Monitor command implementation.
//!
//! Connects through the factory, then prints every event from the
//! connection's event channel until interrupted, the reading limit is hit,
//! or reconnection gives up.

use std::io::{self, Write};

use anyhow::{Context, Result};
use ridelink_core::{DeviceHandle, SensorConfig, SensorEvent, SensorFactory};
use ridelink_types::{ConnectionStatus, SensorKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::format::{format_event_json, format_reading_line, format_status_line};

/// Arguments for the monitor command.
pub struct MonitorOptions {
    pub kind: SensorKind,
    pub json: bool,
    pub count: u64,
    pub quiet: bool,
}

pub async fn cmd_monitor(config: SensorConfig, options: MonitorOptions) -> Result<()> {
    let MonitorOptions {
        kind,
        json,
        count,
        quiet,
    } = options;

    let factory = SensorFactory::new(config);
    if !quiet {
        eprintln!("Looking for a {} sensor via {} host...", kind, factory.host());
    }

    let connection = factory
        .connect(kind)
        .await
        .with_context(|| format!("Failed to connect to a {} sensor", kind))?;
    let mut events = connection.events();
    info!("Connected to {}", connection.device());

    let mut out = io::stdout();
    // The initial status is published before the channel exists.
    print_status(&mut out, connection.device(), kind, ConnectionStatus::Connected, json)?;

    let mut readings: u64 = 0;
    let outcome = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Output fell behind, skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break Ok(()),
        };

        if json {
            writeln!(out, "{}", format_event_json(&event)?)?;
        }
        match event {
            SensorEvent::Reading { reading, .. } => {
                if !json {
                    writeln!(out, "{}", format_reading_line(kind, &reading))?;
                }
                readings += 1;
                if count > 0 && readings >= count {
                    break Ok(());
                }
            }
            SensorEvent::Status { status, .. } => {
                if !json && !quiet {
                    writeln!(out, "{}", format_status_line(status))?;
                }
                if status == ConnectionStatus::Failed {
                    break Err(anyhow::anyhow!(
                        "Lost {} and could not reconnect",
                        connection.device_name()
                    ));
                }
            }
            _ => {}
        }
        out.flush()?;
    };

    connection
        .disconnect()
        .await
        .context("Failed to disconnect cleanly")?;
    if !quiet && outcome.is_ok() {
        eprintln!("Received {} readings.", readings);
    }
    outcome
}

fn print_status(
    out: &mut impl Write,
    device: &DeviceHandle,
    kind: SensorKind,
    status: ConnectionStatus,
    json: bool,
) -> Result<()> {
    if json {
        let event = SensorEvent::Status {
            device: device.clone(),
            kind,
            status,
        };
        writeln!(out, "{}", format_event_json(&event)?)?;
    } else {
        writeln!(out, "{} ({})", format_status_line(status), device)?;
    }
    Ok(())
}
