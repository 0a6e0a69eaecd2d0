//! Logging
//!
//! Two separate streams:
//! - `tracing` for the link's own diagnostics (see [`init_tracing`])
//! - [`LogEntry`] values describing MSP traffic, pushed to an optional
//!   bounded channel for whoever wants to display or store them

pub mod entry;

pub use entry::{Direction, LogEntry, LogKind};

use tokio::sync::mpsc;

/// Sender side of the traffic log channel
pub type LogSender = mpsc::Sender<LogEntry>;

/// Initialize tracing output
///
/// Call early in main() before any logging occurs. `RUST_LOG` overrides the
/// default level (`debug` when `verbose`, `info` otherwise).
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(false)
                .compact(),
        )
        .with(filter)
        .try_init();
}

/// Push an entry without blocking; dropped when the channel is full or gone
#[inline]
pub fn try_log(log_tx: &Option<LogSender>, entry: LogEntry, context: &str) {
    if let Some(tx) = log_tx {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(entry) {
            tracing::trace!("Log channel full, dropping {} entry", context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_log_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let tx = Some(tx);
        try_log(&tx, LogEntry::system("one"), "test");
        try_log(&tx, LogEntry::system("two"), "test");
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            LogKind::System { ref message } if message == "one"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_try_log_without_channel() {
        try_log(&None, LogEntry::system("ignored"), "test");
    }
}
