//! Newline-delimited JSON protocol spoken with driver processes.
//!
//! Requests:  `{"id":"req-1","method":"probe","params":{}}`
//! Responses: `{"id":"req-1","ok":true,"result":{...}}` or `{"id":..,"ok":false,"error":".."}`
//! Events:    `{"event":"qr","value":".."}`, `{"event":"authenticated"}`, ...

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Challenge, ChallengeKind, DriverEvent};

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    pub id: &'a str,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum WireEvent {
    Qr {
        value: String,
    },
    PairingCode {
        value: String,
    },
    Authenticated,
    Ready,
    LoggedOut,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    State {
        state: String,
    },
}

impl From<WireEvent> for DriverEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Qr { value } => DriverEvent::Challenge(Challenge::qr(value)),
            WireEvent::PairingCode { value } => {
                DriverEvent::Challenge(Challenge::pairing_code(value))
            }
            WireEvent::Authenticated => DriverEvent::Authenticated,
            WireEvent::Ready => DriverEvent::Ready,
            WireEvent::LoggedOut => DriverEvent::LoggedOut,
            WireEvent::Disconnected { reason } => DriverEvent::Disconnected { reason },
            WireEvent::State { state } => DriverEvent::StateChanged { state },
        }
    }
}

/// Challenge as returned by `issue_challenge`.
#[derive(Debug, Deserialize)]
pub(crate) struct WireChallenge {
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
    pub value: String,
}

#[derive(Debug)]
pub(crate) enum WireMessage {
    Response(WireResponse),
    Event(WireEvent),
}

impl WireMessage {
    /// Lines carrying an `event` key are events; everything else must be a response.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("event").is_some() {
            return Ok(WireMessage::Event(serde_json::from_value(value)?));
        }
        Ok(WireMessage::Response(serde_json::from_value(value)?))
    }
}
