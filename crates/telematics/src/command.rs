//! Remote command vocabulary and token deduplication

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wire_protocol::{Ack, RemoteCommand, Reply};

/// Result text for a command that was carried out
pub const RESULT_OK: &str = "OK";
/// Result text for a command outside the vocabulary
pub const RESULT_INVALID: &str = "INVALID";
/// Result text for a diagnostic request the vehicle never answered
pub const RESULT_TIMEOUT: &str = "TIMEOUT";

/// A command accepted from the server or the local console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LED=<n>`: set the indicator mode
    SetIndicator(u8),
    /// `REBOOT`: flush storage and restart the device
    Restart,
    /// `STANDBY`: enter standby immediately
    Standby,
    /// `OBD=<request>`: raw vehicle-bus passthrough
    Diagnostic(String),
    /// `VIN`: report the VIN read at setup
    Vin,
    /// `UPTIME`: seconds since start
    Uptime,
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(mode) = text.strip_prefix("LED=") {
            return match mode.parse() {
                Ok(mode) => Command::SetIndicator(mode),
                Err(_) => Command::Unknown(text.to_string()),
            };
        }
        if let Some(request) = text.strip_prefix("OBD=") {
            return Command::Diagnostic(request.to_string());
        }
        match text {
            "REBOOT" => Command::Restart,
            "STANDBY" => Command::Standby,
            "VIN" => Command::Vin,
            "UPTIME" => Command::Uptime,
            _ => Command::Unknown(text.to_string()),
        }
    }
}

/// Carries out commands on the device
#[async_trait]
pub trait CommandExecutor: Send {
    /// Execute `command` and return its textual result
    async fn execute(&mut self, command: Command) -> String;
}

/// Executes each token at most once
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    last_token: u32,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest token executed so far
    pub fn last_token(&self) -> u32 {
        self.last_token
    }

    /// Handle a validated COMMAND frame
    ///
    /// Returns `None` for a frame missing `TK` or `CMD`; no ACK is owed.
    pub async fn process_reply<E>(&mut self, reply: &Reply, executor: &mut E) -> Option<Ack>
    where
        E: CommandExecutor + ?Sized,
    {
        match RemoteCommand::from_reply(reply) {
            Ok(command) => Some(self.process(&command, executor).await),
            Err(e) => {
                warn!("Ignoring malformed command: {}", e);
                None
            }
        }
    }

    pub async fn process<E>(&mut self, command: &RemoteCommand, executor: &mut E) -> Ack
    where
        E: CommandExecutor + ?Sized,
    {
        if command.token <= self.last_token {
            debug!(
                "Command token {} already processed (last {})",
                command.token, self.last_token
            );
            metrics::counter!("telemetry_commands_duplicate_total").increment(1);
            return Ack::duplicate(command.token);
        }

        info!("Executing command {} (token {})", command.command, command.token);
        let result = executor.execute(Command::parse(&command.command)).await;
        self.last_token = command.token;
        metrics::counter!("telemetry_commands_executed_total").increment(1);
        Ack::result(command.token, result)
    }
}
