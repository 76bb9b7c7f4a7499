//! Wire codec for envelopes.
//!
//! Envelopes travel as flat JSON text. Decoding yields an untyped value:
//! validation belongs to the receiving messenger, which drops anything
//! malformed without surfacing it.

use framebridge_core::Envelope;
use serde_json::Value;

/// Wire codec error.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message is not a JSON object")]
    NotAnObject,
}

/// Encode an envelope as JSON text.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, WireError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode JSON text into a raw, unvalidated message.
///
/// # Errors
/// Returns error if the text is not a JSON object.
pub fn decode(text: &str) -> Result<Value, WireError> {
    match serde_json::from_str::<Value>(text)? {
        value @ Value::Object(_) => Ok(value),
        _ => Err(WireError::NotAnObject),
    }
}

#[cfg(test)]
mod tests {
    use framebridge_core::{Category, Role};
    use serde_json::json;

    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            Role::Host,
            "https://host.test",
            Category::Navigation,
            "navigate_to",
            json!({"route": "/list", "params": {"page": 2}}),
            false,
        )
    }

    #[test]
    fn test_envelope_stays_flat() {
        let text = encode(&sample()).unwrap();
        let value = decode(&text).unwrap();
        let object = value.as_object().unwrap();
        for (key, field) in object {
            if key != "data" {
                assert!(
                    !field.is_object() && !field.is_array(),
                    "field {key} is nested"
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(decode("[1,2,3]"), Err(WireError::NotAnObject)));
        assert!(matches!(decode("not json"), Err(WireError::Json(_))));
    }
}
