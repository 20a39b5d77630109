//! Transport variants selected by configuration

use crate::config::{LinkConfig, LinkKind};
use crate::error::LinkError;
use crate::peripherals::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Largest datagram accepted from the collector
const MAX_DATAGRAM: usize = 1500;

/// Build the transport named by `config.kind`
pub fn build_transport(config: &LinkConfig) -> Box<dyn Transport> {
    match config.kind {
        LinkKind::Udp => Box::new(UdpTransport::new()),
        LinkKind::Serial => Box::new(SerialTransport::new(&config.serial_device, config.baud_rate)),
    }
}

/// One UDP datagram per frame
#[derive(Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&mut self, host: &str, port: u16) -> Result<(), LinkError> {
        let endpoint = format!("{}:{}", host, port);
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| LinkError::Open(endpoint.clone(), e.to_string()))?;
        socket
            .connect((host, port))
            .await
            .map_err(|e| LinkError::Open(endpoint.clone(), e.to_string()))?;
        info!("UDP link to {} open", endpoint);
        self.socket = Some(socket);
        Ok(())
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP link closed");
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let socket = self.socket.as_ref().ok_or(LinkError::NotOpen)?;
        socket.send(frame).await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let socket = self.socket.as_ref()?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let read = tokio::time::timeout(timeout, socket.recv(&mut buf)).await;
        match read {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Some(buf)
            }
            Ok(Err(e)) => {
                warn!("UDP receive error: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    fn device_name(&self) -> String {
        "UDP".to_string()
    }
}

/// Newline-delimited frames over a serial modem or bridge
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<BufReader<SerialStream>>,
    /// Bytes of a line not yet terminated
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            port: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, host: &str, port: u16) -> Result<(), LinkError> {
        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(|e| LinkError::Open(self.path.clone(), e.to_string()))?;
        info!(
            "Serial link on {} @ {} baud open (collector {}:{})",
            self.path, self.baud_rate, host, port
        );
        self.port = Some(BufReader::new(stream));
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Serial link on {} closed", self.path);
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        port.write_all(frame).await?;
        port.write_all(b"\n").await?;
        port.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let port = self.port.as_mut()?;
        let read = tokio::time::timeout(timeout, port.read_until(b'\n', &mut self.pending)).await;
        match read {
            Ok(Ok(0)) => None,
            Ok(Ok(_)) if self.pending.ends_with(b"\n") => {
                let mut line = std::mem::take(&mut self.pending);
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                (!line.is_empty()).then_some(line)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!("Serial receive error: {}", e);
                None
            }
            // Partial bytes stay in `pending` for the next call
            Err(_) => None,
        }
    }

    fn device_name(&self) -> String {
        format!("Serial {}", self.path)
    }
}
