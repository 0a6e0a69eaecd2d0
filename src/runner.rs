//! Link runner
//!
//! Opens the configured transport, drives an [`MspLink`] over it and keeps
//! the flight controller talking: handshake on connect, then periodic
//! telemetry polls. Serial and TCP links reconnect when lost; a replay runs
//! once to the end of the recording.

use crate::config::{Config, TransportKind};
use crate::constants::{POST_DISCONNECT_DELAY_SECS, RECONNECT_DELAY_SECS};
use crate::error::{LinkError, Result};
use crate::link::MspLink;
use crate::logging::{self, LogEntry, LogSender};
use crate::msp::MspCode;
use crate::sequence;
use crate::transport::{ReplayTransport, SerialTransport, TcpTransport, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Run until `shutdown` is set (or the recording ends, for replays)
pub async fn run(
    config: &Config,
    link: Arc<MspLink>,
    shutdown: Arc<AtomicBool>,
    log_tx: Option<LogSender>,
) -> Result<()> {
    match config.link.transport {
        TransportKind::Replay => run_replay(config, link, shutdown, log_tx).await,
        TransportKind::Serial | TransportKind::Tcp => {
            run_with_reconnect(config, link, shutdown, log_tx).await
        }
    }
}

// =============================================================================
// Live links (with auto-reconnection)
// =============================================================================

async fn run_with_reconnect(
    config: &Config,
    link: Arc<MspLink>,
    shutdown: Arc<AtomicBool>,
    log_tx: Option<LogSender>,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        let (channels, description) = match open_live(config, shutdown.clone()) {
            Ok(opened) => opened,
            Err(e) => {
                debug!("{}", e);
                logging::try_log(&log_tx, LogEntry::system(e.to_string()), "open_failed");
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
        };

        info!("Connected: {}", description);
        logging::try_log(
            &log_tx,
            LogEntry::system(format!("Connected: {}", description)),
            "connected",
        );

        if config.recording.enabled {
            start_recording(config, &link);
        }

        tokio::select! {
            result = link.run(channels, shutdown.clone()) => {
                if let Err(e) = result {
                    warn!("Link stopped: {}", e);
                }
            }
            _ = keep_alive(config, &link) => {}
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        logging::try_log(
            &log_tx,
            LogEntry::system("Connection lost, reconnecting..."),
            "connection_lost",
        );
        tokio::time::sleep(Duration::from_secs(POST_DISCONNECT_DELAY_SECS)).await;
    }

    Ok(())
}

fn open_live(
    config: &Config,
    shutdown: Arc<AtomicBool>,
) -> Result<(crate::transport::TransportChannels, String)> {
    match config.link.transport {
        TransportKind::Tcp => {
            let address = config.link.tcp_address.clone();
            let channels = TcpTransport::new(address.as_str()).spawn(shutdown)?;
            Ok((channels, format!("TCP {}", address)))
        }
        _ => {
            let port = if config.link.serial_port.is_empty() {
                SerialTransport::available()
                    .into_iter()
                    .next()
                    .ok_or_else(|| LinkError::SerialOpen {
                        port: "(auto)".into(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no serial port found",
                        ),
                    })?
            } else {
                config.link.serial_port.clone()
            };
            let channels = SerialTransport::new(port.as_str())
                .baud_rate(config.link.baud_rate)
                .spawn(shutdown)?;
            Ok((
                channels,
                format!("Serial {} @ {} baud", port, config.link.baud_rate),
            ))
        }
    }
}

fn start_recording(config: &Config, link: &MspLink) {
    let dir = &config.recording.directory;
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Cannot create {:?}: {}", dir, e);
        return;
    }
    let path = config.recording.next_path();
    match link.start_recording(&path) {
        Ok(()) => info!("Recording to {:?}", path),
        Err(e) => warn!("Recording disabled: {}", e),
    }
}

/// Handshake, then poll telemetry forever
async fn keep_alive(config: &Config, link: &MspLink) {
    match sequence::handshake().run(link.requests()).await {
        Ok(outcome) if outcome.is_success() => {
            let identity = link.state().identity.read().clone();
            info!(
                "Flight controller: {} {} (API {}, board {})",
                identity.fc_variant, identity.fc_version, identity.api_version, identity.board_id
            );
        }
        Ok(outcome) => warn!("Handshake incomplete: {:?}", outcome),
        Err(e) => warn!("Handshake not sent: {}", e),
    }

    poll_telemetry(link, &config.telemetry.codes(), config.telemetry.poll_interval()).await
}

/// Send `codes` every `interval`, without acknowledgement
pub async fn poll_telemetry(link: &MspLink, codes: &[MspCode], interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !link.is_connected() {
            continue;
        }
        for &code in codes {
            if let Err(e) = link.poll(code) {
                warn!("Cannot poll {}: {}", code, e);
            }
        }
        let (tx_kbps, rx_kbps) = link.stats().update_rates();
        if rx_kbps > 0.0 || tx_kbps > 0.0 {
            debug!("rx {:.1} KB/s, tx {:.1} KB/s, latency {:?}", rx_kbps, tx_kbps, link.latency());
        }
    }
}

// =============================================================================
// Replay (no reconnection)
// =============================================================================

async fn run_replay(
    config: &Config,
    link: Arc<MspLink>,
    shutdown: Arc<AtomicBool>,
    log_tx: Option<LogSender>,
) -> Result<()> {
    let path = config
        .link
        .replay_file
        .clone()
        .ok_or(LinkError::ConfigValidation {
            field: "link.replay_file",
            reason: "required when transport = \"replay\"".into(),
        })?;

    let transport = ReplayTransport::open(&path)?;
    link.state().restore(transport.snapshot().clone());
    link.set_replaying(true);

    let stats = transport.stats();
    info!(
        "Replaying {:?} (flight time {:.0} s, max altitude {:.0} m)",
        path, stats.flight_time, stats.max_altitude
    );
    logging::try_log(
        &log_tx,
        LogEntry::system(format!("Replaying {}", path.display())),
        "replay_started",
    );

    let channels = transport.spawn(shutdown.clone())?;
    link.run(channels, shutdown).await?;

    logging::try_log(&log_tx, LogEntry::system("Replay finished"), "replay_finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flightlog::FlightLogWriter;
    use crate::msp::codec::write_frame;
    use crate::msp::Direction;
    use crate::state::VehicleState;

    #[tokio::test]
    async fn test_replay_applies_recorded_frames() {
        let path = std::env::temp_dir().join(format!("msp-link-runner-{}.mfl", std::process::id()));
        {
            let recorded = VehicleState::new();
            recorded.identity.write().fc_variant = "BTFL".into();
            let mut writer = FlightLogWriter::create(&path, &recorded).unwrap();
            let mut frame = Vec::new();
            write_frame(Direction::Response, MspCode::Sonar.id(), &77i32.to_le_bytes(), &mut frame)
                .unwrap();
            writer.write_chunk(&frame, false).unwrap();
            writer.finish(&recorded).unwrap();
        }

        let mut config = Config::default();
        config.link.transport = TransportKind::Replay;
        config.link.replay_file = Some(path.clone());

        let link = MspLink::new(Arc::new(VehicleState::new()));
        run(&config, link.clone(), Arc::new(AtomicBool::new(false)), None)
            .await
            .unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(link.state().identity.read().fc_variant, "BTFL");
        assert_eq!(link.state().altitude.read().sonar, 77);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_replay_missing_file() {
        let mut config = Config::default();
        config.link.transport = TransportKind::Replay;
        config.link.replay_file = Some("/no/such/flight.mfl".into());
        let link = MspLink::new(Arc::new(VehicleState::new()));
        let result = run(&config, link, Arc::new(AtomicBool::new(false)), None).await;
        assert!(matches!(result, Err(LinkError::Io { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sends_configured_codes() {
        let link = MspLink::new(Arc::new(VehicleState::new()));
        link.opened();
        let codes = [MspCode::Status, MspCode::Attitude];

        let _ = tokio::time::timeout(
            Duration::from_millis(50),
            poll_telemetry(&link, &codes, Duration::from_millis(100)),
        )
        .await;

        let out = link.next_output_chunk().unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(out[4], MspCode::Status.id());
        assert_eq!(out[10], MspCode::Attitude.id());
        // Polls are fire and forget
        assert_eq!(link.requests().pending_count(), 0);
    }
}
