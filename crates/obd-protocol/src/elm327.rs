//! ELM327 Adapter Driver
//!
//! Speaks the adapter's text protocol over any async byte stream. Commands
//! are terminated with `\r`; a reply is complete once the `>` prompt
//! arrives.

use crate::bus::VehicleBus;
use crate::error::ObdError;
use crate::pid::{Pid, PidResponse};
use crate::protocol::ObdProtocol;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// `ATZ` resets the adapter and takes noticeably longer than a query
const RESET_TIMEOUT_MS: u64 = 5000;

const PROMPT: u8 = b'>';

/// Most replies remembered as owed to commands that timed out
const MAX_OWED_REPLIES: usize = 3;

/// Vehicle bus behind an ELM327-compatible adapter
pub struct Elm327Bus<S> {
    stream: S,
    /// Device path or other label for logs
    device: String,
    protocol: ObdProtocol,
    timeout: Duration,
    connected: bool,
    /// Bytes read past the last prompt
    buffered: Vec<u8>,
    /// Replies the adapter still owes for commands that timed out
    owed: usize,
}

impl Elm327Bus<SerialStream> {
    /// Open the adapter's serial port
    pub fn open_serial(path: &str, baud_rate: u32, protocol: ObdProtocol) -> Result<Self, ObdError> {
        info!("Opening OBD adapter on {} @ {} baud", path, baud_rate);
        let stream = tokio_serial::new(path, baud_rate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open_native_async()
            .map_err(|e| ObdError::Link(format!("{}: {}", path, e)))?;
        Ok(Self::new(stream, path, protocol))
    }
}

impl<S> Elm327Bus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, device: &str, protocol: ObdProtocol) -> Self {
        Self {
            stream,
            device: device.to_string(),
            protocol,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connected: false,
            buffered: Vec::new(),
            owed: 0,
        }
    }

    /// Set command timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn protocol(&self) -> ObdProtocol {
        self.protocol
    }

    /// Write one command and collect everything up to the prompt
    ///
    /// A command that times out still gets its reply eventually; that late
    /// reply is discarded instead of being taken for the next command's.
    async fn exchange(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        self.discard_buffered_replies();
        let owed = self.owed;
        debug!("OBD >> {}", command);
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r").await?;
        self.stream.flush().await?;

        let reply = match tokio::time::timeout(timeout, self.next_reply()).await {
            Ok(reply) => reply?,
            Err(_) => {
                // a reply dropped as late may have been this command's own
                if self.owed == owed {
                    self.owed = (self.owed + 1).min(MAX_OWED_REPLIES);
                }
                return Err(ObdError::Timeout(timeout.as_millis() as u64));
            }
        };
        let reply = String::from_utf8_lossy(&reply).to_string();
        debug!("OBD << {}", reply.trim_end_matches(PROMPT as char).trim());
        Ok(reply)
    }

    /// Drop complete late replies that are already buffered
    fn discard_buffered_replies(&mut self) {
        while self.owed > 0 {
            let Some(end) = self.buffered.iter().position(|&b| b == PROMPT) else {
                break;
            };
            let stale: Vec<u8> = self.buffered.drain(..=end).collect();
            debug!("OBD late reply dropped: {}", String::from_utf8_lossy(&stale).trim());
            self.owed -= 1;
        }
    }

    /// Reply to the command just written, skipping any still owed
    async fn next_reply(&mut self) -> Result<Vec<u8>, ObdError> {
        loop {
            let reply = self.read_until_prompt().await?;
            if self.owed == 0 {
                return Ok(reply);
            }
            self.owed -= 1;
            debug!("OBD late reply dropped: {}", String::from_utf8_lossy(&reply).trim());
        }
    }

    async fn read_until_prompt(&mut self) -> Result<Vec<u8>, ObdError> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(end) = self.buffered.iter().position(|&b| b == PROMPT) {
                return Ok(self.buffered.drain(..=end).collect());
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ObdError::AdapterNotResponding);
            }
            self.buffered.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send an adapter or OBD command and reject error replies
    async fn command(&mut self, command: &str) -> Result<String, ObdError> {
        let timeout = self.timeout;
        let reply = self.exchange(command, timeout).await?;
        let upper = reply.to_ascii_uppercase();
        if upper.contains("UNABLE TO CONNECT") || upper.contains("CAN ERROR") {
            return Err(ObdError::VehicleNotConnected);
        }
        if upper.trim_start().starts_with('?') {
            return Err(ObdError::InvalidResponse(reply));
        }
        Ok(reply)
    }
}

/// Two-digit hex tokens of a reply, line by line
fn hex_lines(reply: &str) -> Vec<Vec<u8>> {
    reply
        .split(['\r', '\n'])
        .map(|line| {
            line.split_whitespace()
                .filter(|token| token.len() == 2)
                .filter_map(|token| u8::from_str_radix(token, 16).ok())
                .collect::<Vec<u8>>()
        })
        .filter(|bytes| !bytes.is_empty())
        .collect()
}

/// Trouble codes from a Mode 03 reply
fn parse_dtcs(reply: &str, can: bool, max: usize) -> Vec<u16> {
    let mut codes = Vec::new();
    for line in hex_lines(reply) {
        let Some(rest) = line.strip_prefix(&[0x43u8]) else {
            continue;
        };
        let rest = if can { rest.get(1..).unwrap_or(&[]) } else { rest };
        codes.extend(
            rest.chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .filter(|&code| code != 0),
        );
    }
    codes.truncate(max);
    codes
}

/// VIN characters from a Mode 09 PID 02 reply
///
/// Header and counter bytes are never VIN characters (I, O and Q are not
/// allowed in a VIN either), so the VIN is the last 17 that are.
fn parse_vin(reply: &str) -> Option<String> {
    let chars: Vec<char> = hex_lines(reply)
        .into_iter()
        .flatten()
        .map(char::from)
        .filter(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        .filter(|&c| !matches!(c, 'I' | 'O' | 'Q'))
        .collect();
    if chars.len() < 17 {
        return None;
    }
    Some(chars[chars.len() - 17..].iter().collect())
}

#[async_trait]
impl<S> VehicleBus for Elm327Bus<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn init(&mut self) -> Result<(), ObdError> {
        info!("Initializing OBD adapter on {}", self.device);
        let banner = self
            .exchange("ATZ", Duration::from_millis(RESET_TIMEOUT_MS))
            .await
            .map_err(|_| ObdError::AdapterNotResponding)?;
        debug!("Adapter: {}", banner.trim_end_matches(PROMPT as char).trim());

        for setup in ["ATE0", "ATL0", self.protocol.to_elm_command()] {
            self.command(setup).await?;
        }

        let reply = self.command("0100").await?;
        let hex: String = reply.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if !hex.to_ascii_uppercase().contains("4100") {
            warn!("Vehicle did not answer 0100: {}", reply.trim());
            return Err(ObdError::VehicleNotConnected);
        }
        self.connected = true;
        info!("OBD adapter initialized ({:?})", self.protocol);
        Ok(())
    }

    async fn read_parameter(&mut self, pid: Pid) -> Result<i32, ObdError> {
        if !self.connected {
            return Err(ObdError::AdapterNotResponding);
        }
        let reply = self.command(&format!("01{:02X}", pid.as_hex())).await?;
        if reply.to_ascii_uppercase().contains("NO DATA") {
            return Err(ObdError::PidNotSupported(pid.as_hex()));
        }
        PidResponse::parse(pid, &reply)
            .map(|response| response.value)
            .ok_or(ObdError::InvalidResponse(reply))
    }

    async fn read_dtcs(&mut self, max: usize) -> Result<Vec<u16>, ObdError> {
        let reply = self.command("03").await?;
        Ok(parse_dtcs(&reply, self.protocol.is_can(), max))
    }

    async fn read_vin(&mut self) -> Result<String, ObdError> {
        let reply = self.command("0902").await?;
        parse_vin(&reply).ok_or(ObdError::InvalidResponse(reply))
    }

    async fn battery_voltage(&mut self) -> Result<f32, ObdError> {
        let reply = self.command("ATRV").await?;
        reply
            .trim_end_matches(PROMPT as char)
            .trim()
            .trim_end_matches(['V', 'v'])
            .parse::<f32>()
            .map_err(|_| ObdError::InvalidResponse(reply.clone()))
    }

    async fn request(&mut self, command: &str, timeout: Duration) -> Result<String, ObdError> {
        self.exchange(command.trim(), timeout).await
    }

    async fn shutdown(&mut self) {
        if self.connected {
            info!("Disconnecting OBD adapter");
            // low-power mode; the adapter wakes on the next character
            let timeout = self.timeout;
            if let Err(e) = self.exchange("ATLP", timeout).await {
                debug!("ATLP not acknowledged: {}", e);
            }
            self.connected = false;
        }
    }
}
