//! Decoding of remote progress payloads and the terminal-status oracle.
//!
//! The backend writes `{"current": n, "total": m, "status": "..."}` (plus
//! optional extra fields such as `site`). A missing progress record is not an
//! error: it decodes to [`ProgressReading::NotStarted`].

use serde_json::Value;
use thiserror::Error;

use crate::defaults;
use crate::error::Error;
use crate::models::{ProgressPhase, ProgressReading, ProgressSnapshot};

/// Why a progress payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Decode a remote progress response.
///
/// `raw` is `None` when the remote service reported that no progress record
/// exists for the unit.
pub fn parse_progress(raw: Option<&str>) -> Result<ProgressReading, ParseError> {
    let Some(raw) = raw else {
        return Ok(ProgressReading::NotStarted);
    };

    let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    let current = unsigned_field(obj, "current")?;
    let total = unsigned_field(obj, "total")?;
    if total == 0 {
        return Err(ParseError::InvalidField {
            field: "total",
            reason: "must be at least 1".to_string(),
        });
    }

    let status = match obj.get("status") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(ParseError::InvalidField {
                field: "status",
                reason: format!("expected a string, got {other}"),
            })
        }
        None => return Err(ParseError::MissingField("status")),
    };

    // Unknown phases are ignored so older clients keep working against newer
    // backends.
    let phase = obj
        .get("phase")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<ProgressPhase>().ok());

    Ok(ProgressReading::Snapshot(ProgressSnapshot {
        current,
        total,
        status,
        phase,
    }))
}

fn unsigned_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<u64, ParseError> {
    let value = obj.get(field).ok_or(ParseError::MissingField(field))?;
    value.as_u64().ok_or_else(|| ParseError::InvalidField {
        field,
        reason: format!("expected a non-negative integer, got {value}"),
    })
}

/// Status substrings that signal a finished unit.
///
/// Matching is case-insensitive and ignores French accents, so "Terminée",
/// "TERMINÉ" and a decomposed "terminé" all match the marker `termine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalMarkers {
    markers: Vec<String>,
}

impl TerminalMarkers {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let markers = markers
            .into_iter()
            .map(|m| fold(m.as_ref().trim()))
            .filter(|m| !m.is_empty())
            .collect();
        Self { markers }
    }

    /// Parse a comma-separated marker list (as found in the environment).
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn matches(&self, status: &str) -> bool {
        let folded = fold(status);
        self.markers.iter().any(|m| folded.contains(m.as_str()))
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }
}

impl Default for TerminalMarkers {
    fn default() -> Self {
        Self::new(defaults::TERMINAL_MARKERS.iter().copied())
    }
}

/// Lowercase and strip the accents that occur in French status messages.
fn fold(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .map(|c| match c {
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'à' | 'â' | 'ä' => 'a',
            'î' | 'ï' => 'i',
            'ô' | 'ö' => 'o',
            'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect()
}
