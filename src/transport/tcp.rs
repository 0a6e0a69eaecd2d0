//! TCP transport for WiFi telemetry bridges
//!
//! Connects as a client to a transparent serial bridge (ESP8266 style,
//! `192.168.4.1:23` by default).
//!
//! Uses async tokio tasks for I/O:
//! - RX task: reads from the stream, sends to channel
//! - TX task: receives from channel, writes to the stream

use super::{Transport, TransportChannels};
use crate::constants::{
    CHANNEL_CAPACITY, READ_BUFFER_SIZE, SHUTDOWN_POLL_MS, TCP_CONNECT_TIMEOUT_SECS,
    TCP_KEEPALIVE_SECS,
};
use crate::error::{LinkError, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// TCP client transport
///
/// # Example
///
/// ```ignore
/// let transport = TcpTransport::new("192.168.4.1:23");
/// let channels = transport.spawn(shutdown)?;
/// ```
pub struct TcpTransport {
    address: String,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect_error(&self, source: std::io::Error) -> LinkError {
        LinkError::TcpConnect {
            address: self.address.clone(),
            source,
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        self.address
            .to_socket_addrs()
            .map_err(|e| self.connect_error(e))?
            .next()
            .ok_or_else(|| {
                self.connect_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })
    }

    /// Blocking connect with keepalive so a vanished bridge is noticed
    fn connect(&self) -> Result<std::net::TcpStream> {
        let addr = self.resolve()?;
        let map_err = |e| self.connect_error(e);

        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(map_err)?;
        socket
            .connect_timeout(&addr.into(), Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS))
            .map_err(map_err)?;
        socket.set_nodelay(true).map_err(map_err)?;
        socket.set_nonblocking(true).map_err(map_err)?;
        configure_keepalive(&socket).map_err(map_err)?;
        Ok(socket.into())
    }
}

fn configure_keepalive(socket: &Socket) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(TCP_KEEPALIVE_SECS));
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

impl Transport for TcpTransport {
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<TransportChannels> {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let stream = TcpStream::from_std(self.connect()?).map_err(|e| self.connect_error(e))?;
        debug!("Connected to {}", self.address);
        let (mut reader, mut writer) = stream.into_split();
        let poll = Duration::from_millis(SHUTDOWN_POLL_MS);

        // RX task (async)
        let shutdown_rx = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while !shutdown_rx.load(Ordering::Relaxed) {
                match tokio::time::timeout(poll, reader.read(&mut buf)).await {
                    // EOF or socket error: bridge gone
                    Ok(Ok(0)) | Ok(Err(_)) => break,
                    Ok(Ok(n)) => {
                        if in_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    // Timeout - check shutdown flag
                    Err(_) => {}
                }
            }
        });

        // TX task (async)
        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                match tokio::time::timeout(poll, out_rx.recv()).await {
                    Ok(Some(data)) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {}
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
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_transport_new() {
        let transport = TcpTransport::new("192.168.4.1:23");
        assert_eq!(transport.address(), "192.168.4.1:23");
    }

    #[test]
    fn test_unresolvable_address() {
        let transport = TcpTransport::new("not an address");
        assert!(matches!(
            transport.resolve(),
            Err(LinkError::TcpConnect { .. })
        ));
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"$M>").await.unwrap();
            buf
        });

        let transport = TcpTransport::new(address);
        let mut channels = tokio::task::spawn_blocking(move || transport.spawn(shutdown))
            .await
            .unwrap()
            .unwrap();
        channels.tx.send(Bytes::from_static(b"$M<")).await.unwrap();

        assert_eq!(&server.await.unwrap(), b"$M<");
        let reply = channels.rx.recv().await.unwrap();
        assert_eq!(&reply[..], b"$M>");
    }
}
