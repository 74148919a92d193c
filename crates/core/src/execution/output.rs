//! Two-stage decoding of calculation output.
//!
//! Stage one treats stdout as a JSON document. Stage two scans plain text
//! for the same quantities. Both produce a [`CalculationResult`]; when
//! neither finds an energy the output is rejected instead of producing a
//! partial result.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys accepted for each quantity in structured output, in lookup order.
const ENERGY_KEYS: &[&str] = &["energy", "total_energy", "total energy"];
const GRADIENT_KEYS: &[&str] = &["gradient_norm", "gradient norm"];
const GAP_KEYS: &[&str] = &["homo_lumo_gap", "HOMO-LUMO gap / eV", "homo-lumo gap"];
const DIPOLE_KEYS: &[&str] = &["dipole_moment", "dipole"];
const CONVERGED_KEYS: &[&str] = &["converged", "convergence"];

/// Text that marks a calculation as not converged.
const NOT_CONVERGED_MARKERS: &[&str] = &[
    "not converged",
    "failed to converge",
    "convergence failure",
    "scf did not converge",
];

static ENERGY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)total\s+energy\s*[:=]?\s*(-?\d+\.\d+(?:[eE][-+]?\d+)?)")
        .expect("valid regex")
});
static GRADIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)gradient\s+norm\s*[:=]?\s*(-?\d+\.\d+(?:[eE][-+]?\d+)?)")
        .expect("valid regex")
});
static GAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)homo-lumo\s+gap\s*[:=]?\s*(-?\d+\.\d+(?:[eE][-+]?\d+)?)")
        .expect("valid regex")
});
static DIPOLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)dipole(?:\s+moment)?\s*[:=][ \t]*(-?\d+\.\d+)|full:(?:[ \t]+-?\d+\.\d+){3}[ \t]+(-?\d+\.\d+)",
    )
    .expect("valid regex")
});

/// Which decoding stage produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeSource {
    Structured,
    Text,
}

/// Canonical result stored in `jobs.result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    /// Primary energy value (Hartree).
    pub energy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_norm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homo_lumo_gap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dipole_moment: Option<f64>,
    pub converged: bool,
    pub decoded_from: DecodeSource,
}

/// Neither decoding stage found an energy in the output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not decode calculation output ({stdout_bytes} bytes): {reason}")]
pub struct DecodeError {
    pub stdout_bytes: usize,
    pub reason: String,
}

/// Decode calculation stdout, structured first and textual second.
pub fn decode_output(stdout: &str) -> Result<CalculationResult, DecodeError> {
    if let Some(result) = decode_structured(stdout) {
        return Ok(result);
    }
    if let Some(result) = decode_text(stdout) {
        return Ok(result);
    }

    let reason = if stdout.trim().is_empty() {
        "output was empty".to_string()
    } else {
        "no energy value found in structured or text output".to_string()
    };
    Err(DecodeError {
        stdout_bytes: stdout.len(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Structured
// ---------------------------------------------------------------------------

/// Decode stdout as JSON.
///
/// Accepts either the whole stdout as one document or, when the program
/// logs before emitting its summary, the last line that parses as an object.
/// A top-level `result` object is unwrapped.
pub fn decode_structured(stdout: &str) -> Option<CalculationResult> {
    let doc = serde_json::from_str::<Value>(stdout.trim())
        .ok()
        .filter(Value::is_object)
        .or_else(|| {
            stdout
                .lines()
                .rev()
                .map(str::trim)
                .filter(|l| l.starts_with('{'))
                .find_map(|l| serde_json::from_str::<Value>(l).ok())
        })?;

    let mut obj = doc.as_object()?;
    if let Some(inner) = obj.get("result").and_then(Value::as_object) {
        obj = inner;
    }

    let energy = lookup_number(obj, ENERGY_KEYS)?;
    let converged = CONVERGED_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(value_as_bool)
        .unwrap_or(true);

    Some(CalculationResult {
        energy,
        gradient_norm: lookup_number(obj, GRADIENT_KEYS),
        homo_lumo_gap: lookup_number(obj, GAP_KEYS),
        dipole_moment: lookup_number(obj, DIPOLE_KEYS),
        converged,
        decoded_from: DecodeSource::Structured,
    })
}

fn lookup_number(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(value_as_f64)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        // Dipole is sometimes reported as a vector with the norm last.
        Value::Array(items) => items.last().and_then(value_as_f64),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "converged" => Some(true),
            "false" | "no" | "not converged" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Scan free-form text output for the result fields.
///
/// The last match wins for every quantity, since programs often print
/// intermediate values before the final summary.
pub fn decode_text(stdout: &str) -> Option<CalculationResult> {
    let energy = last_capture(&ENERGY_RE, stdout)?;
    let lower = stdout.to_ascii_lowercase();
    let converged = !NOT_CONVERGED_MARKERS.iter().any(|m| lower.contains(m));

    Some(CalculationResult {
        energy,
        gradient_norm: last_capture(&GRADIENT_RE, stdout),
        homo_lumo_gap: last_capture(&GAP_RE, stdout),
        dipole_moment: last_capture(&DIPOLE_RE, stdout),
        converged,
        decoded_from: DecodeSource::Text,
    })
}

fn last_capture(re: &Regex, text: &str) -> Option<f64> {
    re.captures_iter(text)
        .filter_map(|c| {
            c.iter()
                .skip(1)
                .flatten()
                .next()?
                .as_str()
                .parse::<f64>()
                .ok()
        })
        .filter(|v| v.is_finite())
        .last()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const XTB_SUMMARY: &str = r#"
          -------------------------------------------------
         | TOTAL ENERGY               -5.070276993755 Eh   |
         | GRADIENT NORM               0.000179386327 Eh/α |
         | HOMO-LUMO GAP              14.629947608850 eV   |
          -------------------------------------------------
molecular dipole:
                 x           y           z       tot (Debye)
 q only:        0.000      -0.613       0.000
   full:        0.000      -0.912       0.000        2.319
"#;

    #[test]
    fn structured_output_is_decoded() {
        let out = r#"{"energy": -5.070276993755, "homo_lumo_gap": 14.63, "converged": true}"#;
        let r = decode_output(out).unwrap();
        assert_eq!(r.energy, -5.070276993755);
        assert_eq!(r.homo_lumo_gap, Some(14.63));
        assert!(r.converged);
        assert_eq!(r.decoded_from, DecodeSource::Structured);
    }

    #[test]
    fn energy_serializes_verbatim() {
        let r = decode_output(r#"{"total energy": -5.070276993755}"#).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("-5.070276993755"), "{json}");
    }

    #[test]
    fn structured_output_after_log_lines() {
        let out = "reading geometry\nrunning scf\n{\"result\": {\"total_energy\": \"-1.5\", \"converged\": \"no\"}}\n";
        let r = decode_output(out).unwrap();
        assert_eq!(r.energy, -1.5);
        assert!(!r.converged);
        assert_eq!(r.decoded_from, DecodeSource::Structured);
    }

    #[test]
    fn json_without_energy_falls_through_to_text() {
        let out = r#"{"status": "ok", "log": "TOTAL ENERGY -2.25 Eh"}"#;
        let r = decode_output(out).unwrap();
        assert_eq!(r.energy, -2.25);
        assert_eq!(r.decoded_from, DecodeSource::Text);
    }

    #[test]
    fn text_summary_is_decoded() {
        let r = decode_output(XTB_SUMMARY).unwrap();
        assert_eq!(r.energy, -5.070276993755);
        assert_eq!(r.gradient_norm, Some(0.000179386327));
        assert_eq!(r.homo_lumo_gap, Some(14.629947608850));
        assert_eq!(r.dipole_moment, Some(2.319));
        assert!(r.converged);
        assert_eq!(r.decoded_from, DecodeSource::Text);
    }

    #[test]
    fn text_last_energy_wins() {
        let out = "TOTAL ENERGY -1.0\niteration\nTOTAL ENERGY -1.25\n";
        assert_eq!(decode_text(out).unwrap().energy, -1.25);
    }

    #[test]
    fn text_detects_non_convergence() {
        let out = "SCF not converged after 250 cycles\nTOTAL ENERGY -3.0\n";
        assert!(!decode_text(out).unwrap().converged);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_output("segmentation fault (core dumped)").unwrap_err();
        assert!(err.reason.contains("no energy"));
    }

    #[test]
    fn empty_output_is_a_decode_error() {
        assert_matches!(decode_output("  \n"), Err(DecodeError { stdout_bytes: 3, .. }));
    }

    #[test]
    fn non_finite_values_are_ignored() {
        assert!(decode_structured(r#"{"energy": "NaN"}"#).is_none());
    }
}
