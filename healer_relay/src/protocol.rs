//! Relay wire protocol.
//!
//! Every WebSocket text frame is a JSON object `{"event": ..., "data": ...}`.

use healer_env::{Envelope, MessageId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AdmissionError;

/// Client -> relay: an envelope to track and fan out
pub const MESSAGE_SEND: &str = "message:send";
/// Relay -> clients: an envelope to process
pub const MESSAGE_RECEIVE: &str = "message:receive";
/// Both directions: acknowledgment of a relay-held id
pub const MESSAGE_ACK: &str = "message:ack";
/// Bulk snapshot exchange
pub const STATE_SYNC: &str = "state:sync";
/// Client -> relay: request the stored snapshot
pub const STATE_UPDATE: &str = "state:update";
/// Relay -> client: a refused frame
pub const ERROR: &str = "error";

pub const CODE_RATE_LIMITED: &str = "rate_limited";

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Frame {
            event: event.to_string(),
            data,
        }
    }

    /// `message:send` carrying an envelope.
    pub fn send(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Frame::new(MESSAGE_SEND, serde_json::to_value(envelope)?))
    }

    /// `message:receive` carrying an envelope.
    pub fn receive(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Frame::new(MESSAGE_RECEIVE, serde_json::to_value(envelope)?))
    }

    pub fn ack(id: MessageId) -> Self {
        Frame::new(MESSAGE_ACK, json!({ "id": id }))
    }

    pub fn state_sync(snapshot: Value) -> Self {
        Frame::new(STATE_SYNC, snapshot)
    }

    pub fn state_update() -> Self {
        Frame::new(STATE_UPDATE, Value::Null)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Frame::new(ERROR, json!({ "code": code, "message": message.into() }))
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, AdmissionError> {
        serde_json::from_str(text).map_err(|e| AdmissionError::InvalidFrame(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Error code of an `error` frame.
    pub fn error_code(&self) -> Option<&str> {
        if self.event != ERROR {
            return None;
        }
        self.data.get("code").and_then(Value::as_str)
    }

    /// Target id of a `message:ack` frame.
    pub fn ack_id(&self) -> Result<MessageId, AdmissionError> {
        let raw = self
            .data
            .get("id")
            .and_then(Value::as_str)
            .ok_or(AdmissionError::MissingField("id"))?;
        MessageId::parse(raw).ok_or_else(|| AdmissionError::InvalidId {
            field: "id",
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healer_env::{ContextId, EnvelopeKind};

    #[test]
    fn test_frame_wire_shape() {
        let id = MessageId::from_seed(1);
        let text = Frame::ack(id).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "message:ack");
        assert_eq!(value["data"]["id"], id.0.to_string());
    }

    #[test]
    fn test_receive_carries_envelope() {
        let env = Envelope::new(EnvelopeKind::StateChange, json!({}), ContextId::from_seed(1), 5, 10);
        let frame = Frame::receive(&env).unwrap();
        assert_eq!(frame.event, MESSAGE_RECEIVE);
        let back: Envelope = serde_json::from_value(frame.data).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Frame::parse("not json"), Err(AdmissionError::InvalidFrame(_))));
        let frame = Frame::parse(r#"{"event":"state:update"}"#).unwrap();
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn test_ack_id() {
        let id = MessageId::from_seed(9);
        assert_eq!(Frame::ack(id).ack_id(), Ok(id));
        let bad = Frame::new(MESSAGE_ACK, json!({ "id": "nope" }));
        assert!(matches!(bad.ack_id(), Err(AdmissionError::InvalidId { .. })));
        let missing = Frame::new(MESSAGE_ACK, json!({}));
        assert_eq!(missing.ack_id(), Err(AdmissionError::MissingField("id")));
    }

    #[test]
    fn test_error_code() {
        let frame = Frame::error(CODE_RATE_LIMITED, "slow down");
        assert_eq!(frame.error_code(), Some("rate_limited"));
        assert_eq!(Frame::state_update().error_code(), None);
    }
}
