//! Structural parsing of provider payloads.
//!
//! A payload is a JSON object holding an `hourly` and/or `daily` section. Each section is an
//! object with a `time` array and one array per variable, aligned by index with `time`.

use crate::normalize::error::ValidationError;
use crate::types::frequency::Frequency;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

/// One variable's values, still untyped.
#[derive(Debug)]
pub(crate) struct SeriesColumn {
    pub name: String,
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct Section {
    pub frequency: Frequency,
    /// `None` where the payload timestamp is absent or unparseable.
    pub times: Vec<Option<NaiveDateTime>>,
    pub columns: Vec<SeriesColumn>,
}

impl Section {
    /// Number of `(time, variable)` rows this section yields for `column`.
    pub fn row_span(&self, column: &SeriesColumn) -> usize {
        self.times.len().max(column.values.len())
    }
}

pub(crate) fn parse_sections(fetch_id: &str, bytes: &[u8]) -> Result<Vec<Section>, ValidationError> {
    let malformed = |reason: String| ValidationError::MalformedPayload {
        fetch_id: fetch_id.to_string(),
        reason,
    };

    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(root) = root else {
        return Err(malformed("top-level value is not an object".to_string()));
    };

    let mut sections = Vec::new();
    for frequency in Frequency::ALL {
        let key = frequency.section_key();
        let Some(section) = root.get(key) else {
            continue;
        };
        let Value::Object(section) = section else {
            return Err(malformed(format!("'{key}' is not an object")));
        };
        sections.push(parse_section(frequency, section).map_err(malformed)?);
    }

    if sections.is_empty() {
        return Err(malformed("no 'hourly' or 'daily' section".to_string()));
    }
    Ok(sections)
}

fn parse_section(frequency: Frequency, section: &Map<String, Value>) -> Result<Section, String> {
    let key = frequency.section_key();
    let times = match section.get("time") {
        Some(Value::Array(times)) => times.iter().map(|t| parse_time(frequency, t)).collect(),
        Some(_) => return Err(format!("'{key}.time' is not an array")),
        None => return Err(format!("'{key}' has no 'time' array")),
    };

    let mut columns = Vec::new();
    for (name, values) in section {
        if name == "time" {
            continue;
        }
        let Value::Array(values) = values else {
            return Err(format!("'{key}.{name}' is not an array"));
        };
        columns.push(SeriesColumn {
            name: name.clone(),
            values: values.clone(),
        });
    }
    // serde_json maps are sorted, so column order is stable across runs.
    Ok(Section {
        frequency,
        times,
        columns,
    })
}

/// Accepts the provider's ISO layouts and `timeformat=unixtime` seconds.
fn parse_time(frequency: Frequency, value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => match frequency {
            Frequency::Hourly => parse_instant(s),
            Frequency::Daily => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        },
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc()),
        _ => None,
    }
}

/// An ISO local timestamp, `YYYY-MM-DDTHH:MM` with optional seconds.
pub(crate) fn parse_instant(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_both_sections() {
        let bytes = br#"{
            "hourly": {"time": ["2026-02-21T00:00", "garbage"], "temperature_2m": [1.0, 2.0]},
            "daily": {"time": ["2026-02-21"], "temperature_2m_max": [3.0]}
        }"#;
        let sections = parse_sections("f", bytes).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].frequency, Frequency::Hourly);
        assert!(sections[0].times[0].is_some());
        assert!(sections[0].times[1].is_none());
        assert_eq!(sections[1].frequency, Frequency::Daily);
        assert_eq!(
            sections[1].times[0],
            NaiveDate::from_ymd_opt(2026, 2, 21).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(sections[1].columns[0].name, "temperature_2m_max");
    }

    #[test]
    fn test_unix_timestamps() {
        let bytes = br#"{"hourly": {"time": [1771632000], "precipitation": [0.0]}}"#;
        let sections = parse_sections("f", bytes).unwrap();
        assert_eq!(
            sections[0].times[0].map(|t| t.and_utc().timestamp()),
            Some(1771632000)
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let cases: [&[u8]; 7] = [
            b"not json",
            br#"[1, 2]"#,
            br#"{"latitude": 1.0}"#,
            br#"{"hourly": []}"#,
            br#"{"hourly": {"temperature_2m": [1.0]}}"#,
            br#"{"hourly": {"time": "2026-02-21T00:00"}}"#,
            br#"{"hourly": {"time": [], "temperature_2m": 1.0}}"#,
        ];
        for bytes in cases {
            match parse_sections("sopron@x", bytes) {
                Err(ValidationError::MalformedPayload { fetch_id, .. }) => {
                    assert_eq!(fetch_id, "sopron@x")
                }
                other => panic!("expected MalformedPayload, got {other:?}"),
            }
        }
    }
}
