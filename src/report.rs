use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// One phase of a measured http exchange.
///
/// Serialized adjacently tagged, `{"type": "...", "data": {...}}`, with no
/// `data` field for [`Report::End`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Report {
    /// The origin responded with headers
    Start(Start),
    /// One unit of origin body content, as decoded text
    Chunk(Chunk),
    /// The origin stream was exhausted
    End,
    /// The measurement failed
    Error(Failure),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Start {
    /// The response's status
    pub status: u16,
    /// The response's reason
    #[serde(rename = "statusText")]
    pub status_text: String,
    /// The response's headers
    pub headers: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    pub chunk: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Failure {
    pub message: String,
}

/// A [`Report`] stamped with elapsed milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimedReport {
    #[serde(flatten)]
    pub report: Report,
    /// Milliseconds since the measurement started
    pub timing: f64,
    /// Milliseconds since the previous report
    pub delta: f64,
}

impl Report {
    pub fn start(status: u16, status_text: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Report::Start(Start {
            status,
            status_text: status_text.into(),
            headers,
        })
    }

    pub fn chunk(chunk: impl Into<String>) -> Self {
        Report::Chunk(Chunk { chunk: chunk.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Report::Error(Failure {
            message: message.into(),
        })
    }

    /// The wire name of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Report::Start(_) => "start",
            Report::Chunk(_) => "chunk",
            Report::End => "end",
            Report::Error(_) => "error",
        }
    }
}

impl TimedReport {
    /// An error report for a measurement that never started.
    pub fn failure(message: impl Into<String>) -> Self {
        TimedReport {
            report: Report::error(message),
            timing: 0.0,
            delta: 0.0,
        }
    }
}

impl std::fmt::Display for TimedReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>10.2}ms {:>+10.2}ms  {:<5}", self.timing, self.delta, self.report.kind())?;
        match &self.report {
            Report::Start(start) => write!(f, "  {} {}", start.status, start.status_text),
            Report::Chunk(chunk) => write!(f, "  {} bytes {:?}", chunk.chunk.len(), chunk.chunk),
            Report::End => Ok(()),
            Report::Error(failure) => write!(f, "  {}", failure.message),
        }
    }
}

#[test]
fn test_serialize_start() {
    let report = TimedReport {
        report: Report::start(200, "OK", BTreeMap::from([(String::from("content-type"), String::from("text/plain"))])),
        timing: 12.5,
        delta: 12.5,
    };
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "type": "start",
            "data": { "status": 200, "statusText": "OK", "headers": { "content-type": "text/plain" } },
            "timing": 12.5,
            "delta": 12.5
        })
    );
}

#[test]
fn test_serialize_end_without_data() {
    let report = TimedReport {
        report: Report::End,
        timing: 3.0,
        delta: 1.0,
    };
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value, serde_json::json!({ "type": "end", "timing": 3.0, "delta": 1.0 }));
}

#[test]
fn test_deserialize_chunk_and_error() {
    let chunk: TimedReport = serde_json::from_str(r#"{"type":"chunk","timing":5,"delta":2,"data":{"chunk":"ab"}}"#).unwrap();
    assert_eq!(chunk.report, Report::chunk("ab"));
    assert_eq!(chunk.timing, 5.0);
    assert_eq!(chunk.delta, 2.0);
    let error: TimedReport = serde_json::from_str(r#"{"data":{"message":"boom"},"delta":0,"timing":0,"type":"error"}"#).unwrap();
    assert_eq!(error, TimedReport::failure("boom"));
}

#[test]
fn test_deserialize_unknown_type() {
    assert!(serde_json::from_str::<TimedReport>(r#"{"type":"middle","timing":1,"delta":1}"#).is_err());
    assert!(serde_json::from_str::<TimedReport>(r#"{"type":"end","delta":1}"#).is_err());
}

#[test]
fn test_kind() {
    assert_eq!("start", Report::start(204, "No Content", BTreeMap::new()).kind());
    assert_eq!("chunk", Report::chunk("").kind());
    assert_eq!("end", Report::End.kind());
    assert_eq!("error", Report::error("x").kind());
}

#[test]
fn test_display() {
    let line = TimedReport::failure("Could not fetch").to_string();
    assert!(line.contains("error"));
    assert!(line.ends_with("Could not fetch"));
}
