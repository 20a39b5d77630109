//! Requests, replies, and the payloads carried by each event

use crate::error::ProtocolError;
use crate::event::Event;
use crate::frame;
use tracing::debug;

/// Outbound request: `EV=<n>,TS=<ms>[,SK=<key>][,<payload>]*<HH>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub event: Event,
    /// Device uptime in milliseconds
    pub timestamp_ms: u64,
    pub server_key: Option<String>,
    pub payload: Option<String>,
}

impl Request {
    pub fn new(event: Event, timestamp_ms: u64) -> Self {
        Self {
            event,
            timestamp_ms,
            server_key: None,
            payload: None,
        }
    }

    pub fn with_server_key(mut self, key: Option<&str>) -> Self {
        self.server_key = key.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        self.payload = (!payload.is_empty()).then_some(payload);
        self
    }

    /// Encode and seal the request
    pub fn encode(&self) -> Vec<u8> {
        let mut text = format!("EV={},TS={}", self.event.code(), self.timestamp_ms);
        if let Some(key) = &self.server_key {
            text.push_str(",SK=");
            text.push_str(key);
        }
        if let Some(payload) = &self.payload {
            text.push(',');
            text.push_str(payload);
        }
        let mut buf = text.into_bytes();
        frame::seal(&mut buf);
        buf
    }
}

/// A validated inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub event: Event,
    body: String,
}

impl Reply {
    /// Validate the checksum and read the event number
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let body = frame::verify(frame)?;
        let body = std::str::from_utf8(body).map_err(|_| ProtocolError::NotText)?;
        let code = field(body, "EV").ok_or(ProtocolError::MissingField("EV"))?;
        let event = code
            .parse::<u8>()
            .ok()
            .and_then(Event::from_code)
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "EV",
                value: code.to_string(),
            })?;
        Ok(Self {
            event,
            body: body.to_string(),
        })
    }

    /// Validate a frame that must answer a request for `expected`
    pub fn expect(frame: &[u8], expected: Event) -> Result<Self, ProtocolError> {
        let reply = Self::parse(frame).map_err(|e| match e {
            ProtocolError::MissingField("EV") | ProtocolError::InvalidField { field: "EV", .. } => {
                ProtocolError::EventMismatch {
                    expected: expected.code(),
                    found: None,
                }
            }
            other => other,
        })?;
        if reply.event != expected {
            debug!("Reply carries {} while waiting for {}", reply.event, expected);
            return Err(ProtocolError::EventMismatch {
                expected: expected.code(),
                found: Some(reply.event.code()),
            });
        }
        Ok(reply)
    }

    /// Value of a `KEY=value` field, up to the next comma
    pub fn field(&self, key: &str) -> Option<&str> {
        field(&self.body, key)
    }

    /// Everything after `KEY=`, commas included
    pub fn tail_field(&self, key: &str) -> Option<&str> {
        let mut offset = 0;
        for segment in self.body.split(',') {
            if let Some(value) = segment.strip_prefix(key).and_then(|s| s.strip_prefix('=')) {
                let start = offset + segment.len() - value.len();
                return Some(&self.body[start..]);
            }
            offset += segment.len() + 1;
        }
        None
    }

    /// Raw body text without the checksum trailer
    pub fn body(&self) -> &str {
        &self.body
    }
}

fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split(',')
        .filter_map(|segment| segment.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn parse_field<T: std::str::FromStr>(
    reply: &Reply,
    key: &'static str,
) -> Result<Option<T>, ProtocolError> {
    match reply.field(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::InvalidField {
                field: key,
                value: value.to_string(),
            }),
    }
}

/// Identification sent with LOGIN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginPayload {
    pub device_id: String,
    pub vin: Option<String>,
    /// Trouble codes in `P0123` notation
    pub dtcs: Vec<String>,
}

impl LoginPayload {
    pub fn encode(&self) -> String {
        let mut fields = vec![format!("ID={}", self.device_id)];
        if let Some(vin) = self.vin.as_deref().filter(|v| !v.is_empty()) {
            fields.push(format!("VIN={}", vin));
        }
        if !self.dtcs.is_empty() {
            fields.push(format!("DTC={}", self.dtcs.join(";")));
        }
        fields.join(",")
    }
}

/// Session parameters returned by a successful LOGIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub feed_id: u16,
    /// Server wall-clock time (Unix seconds)
    pub server_time: Option<i64>,
    pub server_name: Option<String>,
}

impl LoginReply {
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtocolError> {
        let feed_id = parse_field::<u16>(reply, "ID")?
            .filter(|id| *id != 0)
            .ok_or(ProtocolError::MissingField("ID"))?;
        Ok(Self {
            feed_id,
            server_time: parse_field::<i64>(reply, "TM")?,
            server_name: reply
                .field("SN")
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        })
    }
}

/// Remote command: `TK=<token>,CMD=<text>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub token: u32,
    pub command: String,
}

impl RemoteCommand {
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtocolError> {
        let token = parse_field::<u32>(reply, "TK")?.ok_or(ProtocolError::MissingField("TK"))?;
        let command = reply
            .tail_field("CMD")
            .filter(|c| !c.is_empty())
            .ok_or(ProtocolError::MissingField("CMD"))?;
        Ok(Self {
            token,
            command: command.to_string(),
        })
    }
}

/// What an ACK reports for a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckBody {
    /// Textual result of executing the command
    Result(String),
    /// The token was already processed; nothing was re-executed
    Duplicate,
}

/// Acknowledgment of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub token: u32,
    pub body: AckBody,
}

impl Ack {
    pub fn result(token: u32, text: impl Into<String>) -> Self {
        Self {
            token,
            body: AckBody::Result(text.into()),
        }
    }

    pub fn duplicate(token: u32) -> Self {
        Self {
            token,
            body: AckBody::Duplicate,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.body == AckBody::Duplicate
    }

    pub fn encode(&self) -> String {
        match &self.body {
            AckBody::Result(text) => format!("TK={},MSG={}", self.token, text),
            AckBody::Duplicate => format!("TK={},DUP=1", self.token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(text: &str) -> Vec<u8> {
        let mut buf = text.as_bytes().to_vec();
        frame::seal(&mut buf);
        buf
    }

    #[test]
    fn test_request_layout() {
        let request = Request::new(Event::Login, 1234)
            .with_server_key(Some("KEY"))
            .with_payload("ID=dev1,VIN=123");
        let encoded = request.encode();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.starts_with("EV=1,TS=1234,SK=KEY,ID=dev1,VIN=123*"));
        assert!(frame::verify(&encoded).is_ok());
    }

    #[test]
    fn test_request_without_key_or_payload() {
        let text = String::from_utf8(Request::new(Event::Sync, 5).with_server_key(None).encode()).unwrap();
        assert!(text.starts_with("EV=4,TS=5*"));
    }

    #[test]
    fn test_login_reply_fields() {
        let reply = Reply::expect(&sealed("EV=1,ID=26,TM=1700000000,SN=hub.local"), Event::Login).unwrap();
        let login = LoginReply::from_reply(&reply).unwrap();
        assert_eq!(login.feed_id, 26);
        assert_eq!(login.server_time, Some(1_700_000_000));
        assert_eq!(login.server_name.as_deref(), Some("hub.local"));
    }

    #[test]
    fn test_login_reply_requires_feed_id() {
        let reply = Reply::expect(&sealed("EV=1,ID=0"), Event::Login).unwrap();
        assert_eq!(
            LoginReply::from_reply(&reply),
            Err(ProtocolError::MissingField("ID"))
        );
    }

    #[test]
    fn test_reply_must_echo_event() {
        let err = Reply::expect(&sealed("EV=4"), Event::Login).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::EventMismatch {
                expected: 1,
                found: Some(4)
            }
        );
        let err = Reply::expect(&sealed("ID=26"), Event::Login).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::EventMismatch {
                expected: 1,
                found: None
            }
        );
    }

    #[test]
    fn test_command_keeps_full_text() {
        let reply = Reply::parse(&sealed("EV=3,TK=5,CMD=LED=2")).unwrap();
        let command = RemoteCommand::from_reply(&reply).unwrap();
        assert_eq!(command.token, 5);
        assert_eq!(command.command, "LED=2");

        let reply = Reply::parse(&sealed("EV=3,TK=6,CMD=OBD=010C,010D")).unwrap();
        assert_eq!(RemoteCommand::from_reply(&reply).unwrap().command, "OBD=010C,010D");
    }

    #[test]
    fn test_malformed_command_rejected() {
        let reply = Reply::parse(&sealed("EV=3,CMD=LED=2")).unwrap();
        assert_eq!(
            RemoteCommand::from_reply(&reply),
            Err(ProtocolError::MissingField("TK"))
        );
        let reply = Reply::parse(&sealed("EV=3,TK=4")).unwrap();
        assert_eq!(
            RemoteCommand::from_reply(&reply),
            Err(ProtocolError::MissingField("CMD"))
        );
    }

    #[test]
    fn test_ack_payloads() {
        assert_eq!(Ack::result(5, "OK").encode(), "TK=5,MSG=OK");
        assert_eq!(Ack::duplicate(5).encode(), "TK=5,DUP=1");
    }

    #[test]
    fn test_login_payload() {
        let payload = LoginPayload {
            device_id: "dev1".to_string(),
            vin: Some("WDB123".to_string()),
            dtcs: vec!["P0123".to_string(), "P0456".to_string()],
        };
        assert_eq!(payload.encode(), "ID=dev1,VIN=WDB123,DTC=P0123;P0456");
    }
}
