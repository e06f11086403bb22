//! Common types for the Healer environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an execution context (a tab, a relayed client).
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    /// Creates a new random ContextId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a ContextId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic ContextId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of one envelope instance.
///
/// A retransmission keeps the id; only the attempt metadata changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Allocates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the canonical textual form. Returns `None` for anything that
    /// is not a UUID.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Deterministic id for simulation runs.
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.wrapping_mul(0x9e3779b97f4a7c15).to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What an envelope carries.
///
/// Unrecognized kind strings decode to `Unknown` instead of failing, so the
/// receiving core can log and reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum EnvelopeKind {
    StateChange,
    StateSync,
    Ack,
    Unknown,
}

impl EnvelopeKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::StateChange => "STATE_CHANGE",
            EnvelopeKind::StateSync => "STATE_SYNC",
            EnvelopeKind::Ack => "ACK",
            EnvelopeKind::Unknown => "UNKNOWN",
        }
    }
}

impl From<String> for EnvelopeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "STATE_CHANGE" => EnvelopeKind::StateChange,
            "STATE_SYNC" => EnvelopeKind::StateSync,
            "ACK" | "ACKNOWLEDGEMENT" => EnvelopeKind::Ack,
            _ => EnvelopeKind::Unknown,
        }
    }
}

impl From<EnvelopeKind> for &'static str {
    fn from(kind: EnvelopeKind) -> Self {
        kind.as_str()
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of reliable delivery.
///
/// The payload is opaque at this layer (kind-specific JSON); the protocol
/// core decodes it according to `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per envelope instance, stable across retransmissions
    pub id: MessageId,

    /// Discriminates the payload
    #[serde(rename = "type", alias = "kind")]
    pub kind: EnvelopeKind,

    /// Kind-specific data
    pub payload: serde_json::Value,

    /// Creation time on the origin's clock (ms since Unix epoch)
    pub created_at_ms: u64,

    /// Context that created the envelope; never changes across retries
    pub origin_id: ContextId,

    /// Retransmissions performed so far (the original send is not counted)
    #[serde(default)]
    pub attempt_count: u32,

    /// Total transmissions allowed, original send included
    #[serde(default = "default_attempt_limit")]
    pub attempt_limit: u32,
}

fn default_attempt_limit() -> u32 {
    1
}

impl Envelope {
    /// Creates a fresh envelope with a new id and zero attempts.
    pub fn new(
        kind: EnvelopeKind,
        payload: serde_json::Value,
        origin_id: ContextId,
        attempt_limit: u32,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            payload,
            created_at_ms,
            origin_id,
            attempt_count: 0,
            attempt_limit: attempt_limit.max(1),
        }
    }

    /// Builds an acknowledgment for `target_id`, originating at `origin_id`.
    pub fn ack(target_id: MessageId, origin_id: ContextId, created_at_ms: u64) -> Self {
        Self::new(
            EnvelopeKind::Ack,
            serde_json::json!({ "targetId": target_id }),
            origin_id,
            1,
            created_at_ms,
        )
    }

    /// Copy of this envelope carrying the next attempt number.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Transmissions used so far, the original send included.
    pub fn transmissions(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    /// True once every allowed transmission has been spent.
    pub fn attempts_exhausted(&self) -> bool {
        self.transmissions() >= self.attempt_limit
    }

    /// Serializes to the JSON wire form.
    pub fn to_json(&self) -> Result<String, crate::EnvError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&EnvelopeKind::StateChange).unwrap();
        assert_eq!(json, "\"STATE_CHANGE\"");

        let ack: EnvelopeKind = serde_json::from_str("\"ACKNOWLEDGEMENT\"").unwrap();
        assert_eq!(ack, EnvelopeKind::Ack);

        let other: EnvelopeKind = serde_json::from_str("\"TELEPORT\"").unwrap();
        assert_eq!(other, EnvelopeKind::Unknown);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let origin = ContextId::from_seed(1);
        let env = Envelope::new(
            EnvelopeKind::StateChange,
            serde_json::json!({ "entityId": "n1", "newState": "emergency" }),
            origin,
            5,
            1_000,
        );

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "STATE_CHANGE");
        assert_eq!(value["originId"], origin.as_uuid().to_string());
        assert_eq!(value["attemptCount"], 0);
        assert_eq!(value["attemptLimit"], 5);
        assert_eq!(value["createdAtMs"], 1_000);
    }

    #[test]
    fn test_next_attempt_keeps_identity() {
        let env = Envelope::new(
            EnvelopeKind::StateChange,
            serde_json::Value::Null,
            ContextId::from_seed(7),
            3,
            0,
        );
        let retry = env.next_attempt();

        assert_eq!(retry.id, env.id);
        assert_eq!(retry.origin_id, env.origin_id);
        assert_eq!(retry.attempt_count, 1);
        assert!(!retry.attempts_exhausted());
        assert!(retry.next_attempt().attempts_exhausted());
    }

    #[test]
    fn test_attempt_counter_saturates() {
        let mut env = Envelope::ack(MessageId::from_seed(1), ContextId::from_seed(1), 0);
        env.attempt_count = u32::MAX;

        assert_eq!(env.transmissions(), u32::MAX);
        assert_eq!(env.next_attempt().attempt_count, u32::MAX);
        assert!(env.attempts_exhausted());
    }

    #[test]
    fn test_ack_targets_message() {
        let target = MessageId::from_seed(9);
        let ack = Envelope::ack(target, ContextId::from_seed(2), 50);

        assert_eq!(ack.kind, EnvelopeKind::Ack);
        assert_eq!(ack.payload["targetId"], target.0.to_string());
        assert!(ack.attempts_exhausted());
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::new();
        assert_eq!(MessageId::parse(&id.0.to_string()), Some(id));
        assert_eq!(MessageId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_context_id_from_seed_deterministic() {
        assert_eq!(ContextId::from_seed(3), ContextId::from_seed(3));
        assert_ne!(ContextId::from_seed(3), ContextId::from_seed(4));
    }
}
