//! Admission control for inbound envelopes.
//!
//! Runs on the raw JSON before anything reaches the queue, so a malformed
//! envelope is refused with a precise reason instead of a generic decode
//! error.

use healer_env::{Envelope, EnvelopeKind, MessageId};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AdmissionError;

/// Validates the shape of an envelope and decodes it.
///
/// `max_attempt_limit` caps the retry budget a client may claim; the attempt
/// count must leave at least one transmission within the limit.
pub fn admit_envelope(data: &Value, max_attempt_limit: u32) -> Result<Envelope, AdmissionError> {
    let object = data
        .as_object()
        .ok_or_else(|| AdmissionError::InvalidFrame("envelope must be a JSON object".into()))?;

    let id = required_str(object, "id")?;
    if MessageId::parse(id).is_none() {
        return Err(AdmissionError::InvalidId {
            field: "id",
            value: id.to_string(),
        });
    }

    let kind = object
        .get("type")
        .or_else(|| object.get("kind"))
        .and_then(Value::as_str)
        .ok_or(AdmissionError::MissingField("type"))?;
    if EnvelopeKind::from(kind.to_string()) == EnvelopeKind::Unknown {
        return Err(AdmissionError::InvalidKind(kind.to_string()));
    }

    let origin = required_str(object, "originId")?;
    if Uuid::parse_str(origin).is_err() {
        return Err(AdmissionError::InvalidId {
            field: "originId",
            value: origin.to_string(),
        });
    }

    let envelope: Envelope =
        serde_json::from_value(data.clone()).map_err(|e| AdmissionError::InvalidFrame(e.to_string()))?;

    if envelope.attempt_limit == 0
        || envelope.attempt_limit > max_attempt_limit
        || envelope.attempt_count >= envelope.attempt_limit
    {
        return Err(AdmissionError::InvalidAttempts {
            count: envelope.attempt_count,
            limit: envelope.attempt_limit,
            max: max_attempt_limit,
        });
    }
    Ok(envelope)
}

fn required_str<'a>(
    object: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, AdmissionError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(AdmissionError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use healer_env::ContextId;
    use serde_json::json;

    const MAX: u32 = 32;

    fn valid() -> Value {
        let env = Envelope::new(
            EnvelopeKind::StateChange,
            json!({ "entityId": "n1", "newState": "emergency" }),
            ContextId::from_seed(3),
            5,
            1_000,
        );
        serde_json::to_value(env).unwrap()
    }

    #[test]
    fn test_admits_valid_envelope() {
        let env = admit_envelope(&valid(), MAX).unwrap();
        assert_eq!(env.kind, EnvelopeKind::StateChange);
        assert_eq!(env.attempt_limit, 5);
    }

    #[test]
    fn test_missing_fields() {
        for field in ["id", "type", "originId"] {
            let mut data = valid();
            data.as_object_mut().unwrap().remove(field);
            assert_eq!(admit_envelope(&data, MAX).unwrap_err(), AdmissionError::MissingField(field));
        }
    }

    #[test]
    fn test_non_conforming_ids() {
        let mut data = valid();
        data["id"] = json!("msg-1");
        let err = admit_envelope(&data, MAX).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidId { field: "id", .. }));
        assert_eq!(err.code(), "invalid_envelope");

        let mut data = valid();
        data["originId"] = json!(42);
        assert_eq!(admit_envelope(&data, MAX).unwrap_err(), AdmissionError::MissingField("originId"));
    }

    #[test]
    fn test_unknown_kind() {
        let mut data = valid();
        data["type"] = json!("PING");
        assert_eq!(admit_envelope(&data, MAX).unwrap_err(), AdmissionError::InvalidKind("PING".into()));
    }

    #[test]
    fn test_shape_errors() {
        assert!(matches!(admit_envelope(&json!([1, 2]), MAX), Err(AdmissionError::InvalidFrame(_))));

        let mut data = valid();
        data.as_object_mut().unwrap().remove("createdAtMs");
        assert!(matches!(admit_envelope(&data, MAX), Err(AdmissionError::InvalidFrame(_))));
    }

    #[test]
    fn test_attempt_count_must_fit_the_limit() {
        let mut data = valid();
        data["attemptCount"] = json!(4);
        assert_eq!(admit_envelope(&data, MAX).unwrap().attempt_count, 4);

        data["attemptCount"] = json!(5);
        let err = admit_envelope(&data, MAX).unwrap_err();
        assert_eq!(err, AdmissionError::InvalidAttempts { count: 5, limit: 5, max: MAX });
        assert_eq!(err.code(), "invalid_envelope");

        data["attemptCount"] = json!(u32::MAX);
        assert!(matches!(admit_envelope(&data, MAX), Err(AdmissionError::InvalidAttempts { .. })));
    }

    #[test]
    fn test_attempt_limit_bounds() {
        let mut data = valid();
        data["attemptLimit"] = json!(0);
        assert!(matches!(admit_envelope(&data, MAX), Err(AdmissionError::InvalidAttempts { limit: 0, .. })));

        data["attemptLimit"] = json!(MAX);
        assert!(admit_envelope(&data, MAX).is_ok());

        data["attemptLimit"] = json!(MAX + 1);
        assert!(matches!(admit_envelope(&data, MAX), Err(AdmissionError::InvalidAttempts { .. })));

        data["attemptLimit"] = json!(u32::MAX);
        assert!(matches!(admit_envelope(&data, MAX), Err(AdmissionError::InvalidAttempts { .. })));
    }
}
