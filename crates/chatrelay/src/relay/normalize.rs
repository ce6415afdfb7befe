//! Payload validation and re-serialization for `data:` events

use serde_json::Value;

/// Outcome of normalizing one `data:` payload
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Valid JSON to forward, already re-serialized
    Frame(String),
    /// Keepalive chunk with an empty `choices` collection; forward nothing
    Skip,
    /// Payload was not valid JSON
    ParseError {
        /// The payload exactly as received
        raw: String,
        /// Parser diagnostic
        reason: String,
    },
}

/// Parse `payload`, drop empty-choice keepalives, and re-serialize the rest.
///
/// Azure emits a first chunk carrying only `prompt_filter_results` with
/// `"choices": []`; those reach the client as flicker with no content, so
/// they are skipped. Any other valid JSON value is forwarded.
pub fn normalize(payload: &str) -> Normalized {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return Normalized::ParseError {
                raw: payload.to_string(),
                reason: e.to_string(),
            };
        }
    };

    if has_empty_choices(&value) {
        return Normalized::Skip;
    }

    // Serializing a `Value` cannot fail: every map key is already a string.
    match serde_json::to_string(&value) {
        Ok(json) => Normalized::Frame(json),
        Err(e) => Normalized::ParseError {
            raw: payload.to_string(),
            reason: e.to_string(),
        },
    }
}

fn has_empty_choices(value: &Value) -> bool {
    match value.get("choices") {
        Some(Value::Array(choices)) => choices.is_empty(),
        Some(Value::Object(choices)) => choices.is_empty(),
        _ => false,
    }
}
