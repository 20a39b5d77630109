//! Telemetry Wire Protocol
//!
//! Text frames exchanged with the remote collector. Every frame, in either
//! direction, ends with `*HH`: the 8-bit sum of all preceding bytes in
//! uppercase hex (either case is accepted on receive). Requests start with
//! `EV=<event>,TS=<uptime-ms>`; replies must echo the event they answer.

mod error;
mod event;
pub mod frame;
mod message;

pub use error::ProtocolError;
pub use event::Event;
pub use frame::{checksum, seal, verify};
pub use message::{Ack, AckBody, LoginPayload, LoginReply, RemoteCommand, Reply, Request};
