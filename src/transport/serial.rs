//! Serial transport for USB/UART flight controller links
//!
//! Uses blocking threads for low-latency I/O:
//! - Reader thread: reads from serial port, sends to channel
//! - Writer thread: receives from channel, writes to serial port
//!
//! The transport stops when:
//! - `shutdown` flag is set
//! - Serial port disconnects (detected via consecutive empty reads)
//! - Write error occurs

use super::{Transport, TransportChannels};
use crate::constants::{
    CHANNEL_CAPACITY, DEFAULT_BAUD_RATE, READ_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD,
};
use crate::error::{LinkError, Result};
use bytes::Bytes;
use serialport::SerialPortType;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Read timeout; bounds how long the reader takes to notice shutdown
const READ_TIMEOUT_MS: u64 = 10;

/// Serial transport
///
/// # Example
///
/// ```ignore
/// let transport = SerialTransport::new("/dev/ttyACM0").baud_rate(57_600);
/// let channels = transport.spawn(shutdown)?;
/// ```
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
}

impl SerialTransport {
    /// Create a new serial transport for the specified port
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Baud rate (ignored by USB CDC devices, required by UART radios)
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Names of the serial ports present on this machine, USB ports first
    pub fn available() -> Vec<String> {
        let mut ports = serialport::available_ports().unwrap_or_default();
        ports.sort_by_key(|p| !matches!(p.port_type, SerialPortType::UsbPort(_)));
        ports.into_iter().map(|p| p.port_name).collect()
    }

    fn open(&self) -> Result<Box<dyn serialport::SerialPort>> {
        serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()
            .map_err(|e| self.open_error(e))
    }

    fn open_error(&self, e: serialport::Error) -> LinkError {
        LinkError::SerialOpen {
            port: self.port_name.clone(),
            source: std::io::Error::other(e.to_string()),
        }
    }
}

impl Transport for SerialTransport {
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<TransportChannels> {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let port_read = self.open()?;
        let port_write = port_read.try_clone().map_err(|e| self.open_error(e))?;
        debug!("Opened {} at {} baud", self.port_name, self.baud_rate);

        // Reader thread (blocking)
        let shutdown_reader = shutdown.clone();
        std::thread::spawn(move || {
            let mut port = port_read;
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let mut empty_reads = 0u32;

            while !shutdown_reader.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        empty_reads = 0;
                        if in_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            // Receiver dropped
                            break;
                        }
                    }
                    Ok(_) => {
                        // Zero bytes read - could be normal or port gone
                        empty_reads += 1;
                        if empty_reads > SERIAL_DISCONNECT_THRESHOLD {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        empty_reads = 0;
                    }
                    Err(_) => break,
                }
            }
            // Channel closes when in_tx is dropped
        });

        // Writer thread (blocking)
        std::thread::spawn(move || {
            let mut port = port_write;
            while let Some(data) = out_rx.blocking_recv() {
                if shutdown.load(Ordering::Relaxed) || port.write_all(&data).is_err() {
                    break;
                }
            }
        });

        Ok(TransportChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_new() {
        let transport = SerialTransport::new("/dev/ttyUSB0");
        assert_eq!(transport.port_name(), "/dev/ttyUSB0");
        assert_eq!(transport.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_baud_rate() {
        let transport = SerialTransport::new(String::from("COM4")).baud_rate(57_600);
        assert_eq!(transport.baud_rate, 57_600);
    }

    #[test]
    fn test_open_missing_port() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let result = SerialTransport::new("/dev/does-not-exist-msp").spawn(shutdown);
        assert!(matches!(result, Err(LinkError::SerialOpen { .. })));
    }
}
