//! Job payload validation.
//!
//! A payload that fails here can never succeed on retry, so the caller
//! reports it as [`ExecutionError::InvalidPayload`](super::ExecutionError).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

/// Maximum length of a molecule identifier or inline geometry label.
pub const MAX_MOLECULE_LEN: usize = 256;

// `validator` length bounds are `u64`.
const MAX_MOLECULE_LEN_U64: u64 = MAX_MOLECULE_LEN as u64;

/// Input understood by the external calculation binary.
///
/// Only the fields below are checked; anything else is passed through to
/// the subprocess verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CalculationPayload {
    #[validate(length(min = 1, max = MAX_MOLECULE_LEN_U64))]
    pub molecule: String,
    #[validate(range(min = 1))]
    pub atoms: Option<u32>,
    pub charge: Option<i32>,
    #[validate(range(min = 1))]
    pub multiplicity: Option<u32>,
    #[validate(length(min = 1, max = 64))]
    pub method: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Check that `payload` is a well-formed calculation request.
///
/// Returns the typed payload on success, or a human-readable reason.
pub fn validate_payload(payload: &Value) -> Result<CalculationPayload, String> {
    if !payload.is_object() {
        return Err(format!(
            "payload must be a JSON object, got {}",
            json_type_name(payload)
        ));
    }

    let parsed: CalculationPayload =
        serde_json::from_value(payload.clone()).map_err(|e| format!("payload rejected: {e}"))?;

    parsed
        .validate()
        .map_err(|e| format!("payload rejected: {e}"))?;

    if parsed.molecule.trim().is_empty() {
        return Err("payload rejected: molecule must not be blank".to_string());
    }

    Ok(parsed)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_minimal_payload() {
        let p = validate_payload(&json!({"molecule": "H2O", "atoms": 3})).unwrap();
        assert_eq!(p.molecule, "H2O");
        assert_eq!(p.atoms, Some(3));
        assert!(p.extra.is_empty());
    }

    #[test]
    fn keeps_unknown_fields() {
        let p = validate_payload(&json!({"molecule": "CH4", "solvent": "water"})).unwrap();
        assert_eq!(p.extra["solvent"], "water");
    }

    #[test]
    fn rejects_non_object() {
        let err = validate_payload(&json!(["H2O"])).unwrap_err();
        assert!(err.contains("array"), "{err}");
    }

    #[test]
    fn rejects_missing_molecule() {
        assert!(validate_payload(&json!({"atoms": 3})).is_err());
    }

    #[test]
    fn rejects_blank_molecule() {
        assert!(validate_payload(&json!({"molecule": "   "})).is_err());
        assert!(validate_payload(&json!({"molecule": ""})).is_err());
    }

    #[test]
    fn rejects_zero_atoms() {
        assert!(validate_payload(&json!({"molecule": "H2O", "atoms": 0})).is_err());
    }

    #[test]
    fn rejects_wrong_field_type() {
        assert!(validate_payload(&json!({"molecule": "H2O", "atoms": "three"})).is_err());
    }

    #[test]
    fn rejects_oversized_molecule() {
        let long = "C".repeat(MAX_MOLECULE_LEN + 1);
        assert!(validate_payload(&json!({"molecule": long})).is_err());
    }

    #[test]
    fn molecule_at_length_limit_is_accepted() {
        let name = "C".repeat(MAX_MOLECULE_LEN);
        let parsed = validate_payload(&json!({"molecule": name})).unwrap();
        assert_eq!(parsed.molecule.len(), MAX_MOLECULE_LEN);
    }
}
