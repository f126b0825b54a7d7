use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};

use headband_session::prelude::*;
use headband_session::protocol::EEG_SAMPLES_PER_READING;
use headband_session::sim::{SimConfig, SimulatedProvider};

fn provider(simulate: bool) -> Result<Arc<dyn RadioLinkProvider>> {
    if simulate {
        info!("Using the built-in headset simulator.");
        return Ok(Arc::new(SimulatedProvider::new(SimConfig::default())));
    }
    #[cfg(feature = "ble")]
    {
        use headband_session::ble::{BleConfig, BtleplugProvider};
        Ok(Arc::new(BtleplugProvider::new(BleConfig::default())))
    }
    #[cfg(not(feature = "ble"))]
    {
        anyhow::bail!("built without the `ble` feature; rebuild with `--features ble` or pass --simulate")
    }
}

fn print_sample(sample: &Sample) {
    match sample.stream {
        StreamType::Eeg => {
            let channels: Vec<String> = sample
                .values
                .iter()
                .zip(EEG_CHANNEL_NAMES)
                .map(|(v, name)| format!("{name}={v:+8.3}"))
                .collect();
            println!("[EEG]     ts={:.0} ms  {} µV", sample.timestamp, channels.join(" "));
        }
        StreamType::Ppg => {
            let channels: Vec<String> = sample
                .values
                .iter()
                .zip(PPG_CHANNEL_NAMES)
                .map(|(v, name)| format!("{name}={v:.0}"))
                .collect();
            println!("[PPG]     ts={:.0} ms  {}", sample.timestamp, channels.join(" "));
        }
        StreamType::Accelerometer => println!(
            "[ACCEL]   ts={:.0} ms  x={:+.5}g  y={:+.5}g  z={:+.5}g",
            sample.timestamp, sample.values[0], sample.values[1], sample.values[2]
        ),
        StreamType::Gyroscope => println!(
            "[GYRO]    ts={:.0} ms  x={:+.5}°/s  y={:+.5}°/s  z={:+.5}°/s",
            sample.timestamp, sample.values[0], sample.values[1], sample.values[2]
        ),
        StreamType::Battery => println!("[BATTERY] {:.1}%", sample.values[0]),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=headband_session=debug for verbose output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let flag = |name: &str| args.iter().any(|a| a == name);
    let config = SessionConfig {
        enable_ppg: flag("--ppg"),
        ..SessionConfig::default()
    }
    .with_aux(flag("--aux"));

    let session = Session::spawn(provider(flag("--simulate"))?, config);
    let (listener, mut events) = ChannelListener::new();
    let _subscription = session.subscribe(&listener, Interest::ALL);

    session.start_scanning().await?;
    info!("Scanning for headsets …");
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  p  – pause streaming");
    info!("  r  – resume streaming");
    info!("  d  – disconnect");
    info!("  s  – scan again (after a disconnect or failure)\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (StdinLock is not Send) and
    // relayed to the async loop below.
    let (line_tx, mut lines) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line.trim().to_owned()).is_err() {
                break;
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    let mut eeg_rows: u64 = 0;
    loop {
        tokio::select! {
            Some(line) = lines.recv() => {
                let result = match line.as_str() {
                    "" => continue,
                    "q" => break,
                    "p" => session.stop_streaming().await,
                    "r" => session.start_streaming().await,
                    "d" => session.disconnect().await,
                    "s" => match session.reset().await {
                        Ok(()) => session.start_scanning().await,
                        Err(e) => Err(e),
                    },
                    other => {
                        warn!("Unknown command '{other}'");
                        continue;
                    }
                };
                if let Err(e) = result {
                    error!("{e}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Discovered(device) => {
                        info!("Found {device} ({})", device.model().label());
                        if session.state() == ConnectionState::Scanning {
                            // The scan may have ended since this was queued.
                            if let Err(e) = session.connect(device).await {
                                warn!("Not connecting: {e}");
                            }
                        }
                    }
                    SessionEvent::StateChanged(change) => {
                        info!("{} → {}", change.previous, change.state);
                        if let Some(err) = change.error(session.connect_timeout()) {
                            error!("{err}");
                        }
                        match (change.previous, change.state) {
                            (ConnectionState::Connecting, ConnectionState::Connected) => {
                                match session.start_streaming().await {
                                    Ok(()) => info!("Streaming started."),
                                    Err(e) => error!("{e}"),
                                }
                            }
                            (ConnectionState::Scanning, ConnectionState::Idle)
                                if change.reason == Some(TransitionReason::ScanTimeout) =>
                            {
                                warn!("No headset found; type 's' to scan again or 'q' to quit.");
                            }
                            _ => {}
                        }
                    }
                    SessionEvent::CommandRejected(e) => warn!("Rejected: {e}"),
                    SessionEvent::Sample(sample) => {
                        // One EEG line per notification's worth of rows.
                        if sample.stream == StreamType::Eeg {
                            eeg_rows += 1;
                            if eeg_rows % EEG_SAMPLES_PER_READING as u64 != 1 {
                                continue;
                            }
                        }
                        print_sample(&sample);
                    }
                }
            }
        }
    }

    info!("Quit requested.");
    session.shutdown().await.ok();
    let stats = session.stats();
    info!(
        "Delivered {} sample(s); {} malformed, {} dropped, {} listener failure(s).",
        stats.samples_delivered(),
        stats.malformed_packets(),
        stats.dropped_packets(),
        stats.listener_failures()
    );
    Ok(())
}
