//! Typed views of envelope payloads.

use healer_env::{Envelope, EnvelopeKind, MessageId};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, NodeState};
use crate::error::HealerError;

/// `STATE_CHANGE` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub entity_id: String,
    pub new_state: NodeState,
}

/// `STATE_SYNC` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSync {
    pub entities: Vec<Entity>,
}

/// `ACK` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub target_id: MessageId,
}

/// Decoded envelope body
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    StateChange(StateChange),
    StateSync(StateSync),
    Ack(Ack),
}

impl MessageBody {
    /// Decodes the payload according to the envelope's kind.
    pub fn decode(envelope: &Envelope) -> Result<Self, HealerError> {
        let payload = envelope.payload.clone();
        let kind = envelope.kind;
        let body = match kind {
            EnvelopeKind::StateChange => MessageBody::StateChange(
                serde_json::from_value(payload).map_err(|e| HealerError::malformed(kind, e))?,
            ),
            EnvelopeKind::StateSync => MessageBody::StateSync(
                serde_json::from_value(payload).map_err(|e| HealerError::malformed(kind, e))?,
            ),
            EnvelopeKind::Ack => MessageBody::Ack(
                serde_json::from_value(payload).map_err(|e| HealerError::malformed(kind, e))?,
            ),
            EnvelopeKind::Unknown => {
                return Err(HealerError::malformed(kind, "unrecognized envelope kind"))
            }
        };
        Ok(body)
    }

    /// Kind and JSON payload for this body.
    pub fn encode(&self) -> Result<(EnvelopeKind, serde_json::Value), HealerError> {
        let encoded = match self {
            MessageBody::StateChange(p) => (EnvelopeKind::StateChange, serde_json::to_value(p)?),
            MessageBody::StateSync(p) => (EnvelopeKind::StateSync, serde_json::to_value(p)?),
            MessageBody::Ack(p) => (EnvelopeKind::Ack, serde_json::to_value(p)?),
        };
        Ok(encoded)
    }
}
