//! msp-link - headless MSP ground-station link
//!
//! Usage:
//!   msp-link                         Connect using msp-link.toml
//!   msp-link --serial /dev/ttyACM0   Serial flight controller
//!   msp-link --tcp 192.168.4.1:23    WiFi bridge
//!   msp-link --replay flight.mfl     Play back a recording

use clap::Parser;
use msp_link::cli::Cli;
use msp_link::constants::CHANNEL_CAPACITY;
use msp_link::error::{LinkError, Result};
use msp_link::link::{LinkOptions, MspLink};
use msp_link::logging::{self, LogEntry};
use msp_link::state::VehicleState;
use msp_link::transport::SerialTransport;
use msp_link::{config, runner, Category};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

fn main() {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    if cli.list_ports {
        for port in SerialTransport::available() {
            println!("{}", port);
        }
        return;
    }

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = config::load(&cli.config);
    cli.apply(&mut cfg);
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new().map_err(|source| LinkError::Runtime { source })?;
    rt.block_on(async move {
        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_signal_handler(shutdown.clone());

        // Traffic log: printed at debug level
        let (log_tx, mut log_rx) = mpsc::channel::<LogEntry>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                debug!("{}", entry);
            }
        });

        let link = MspLink::with_options(
            Arc::new(VehicleState::new()),
            LinkOptions {
                request_timeout: cfg.requests.timeout(),
                log_tx: Some(log_tx.clone()),
            },
        );

        let observer = {
            let link = Arc::downgrade(&link);
            Arc::new(move |category: Category| {
                let Some(link) = link.upgrade() else {
                    return;
                };
                if category == Category::Communication {
                    info!(
                        "Link {}",
                        if link.is_connected() { "up" } else { "down" }
                    );
                }
            })
        };
        link.register(&observer);

        runner::run(&cfg, link.clone(), shutdown, Some(log_tx)).await?;

        let stats = link.stats().snapshot();
        info!(
            "Stopped: {} frames, {} framing errors, {} retries, {} failed requests",
            stats.frames, stats.framing_errors, stats.retries, stats.request_failures
        );
        Ok::<(), LinkError>(())
    })
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigterm), Ok(mut sigint)) =
                (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
            else {
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {},
                _ = sigint.recv() => {},
            }
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }
}
