//! Response envelope wrapped around every command result.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "v1";

/// Request identifier (UUID v4) for end-to-end request tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub request_id: RequestId,
    pub schema_version: &'static str,
    pub command: &'static str,
    pub generated_at: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Metadata {
    pub fn new(command: &'static str, latency_ms: u64) -> Self {
        Self {
            request_id: RequestId::new_v4(),
            schema_version: SCHEMA_VERSION,
            command,
            generated_at: now_rfc3339(),
            latency_ms,
            warnings: Vec::new(),
        }
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub meta: Metadata,
    pub data: Value,
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_serializes_meta_before_data() {
        let mut meta = Metadata::new("metric", 12);
        meta.push_warning("result truncated");
        let envelope = Envelope {
            meta,
            data: json!({ "row_count": 0 }),
        };

        let value = serde_json::to_value(&envelope).expect("json");
        assert_eq!(value["meta"]["command"], "metric");
        assert_eq!(value["meta"]["latency_ms"], 12);
        assert_eq!(value["meta"]["warnings"][0], "result truncated");
        assert_eq!(value["data"]["row_count"], 0);
        assert_eq!(RequestId::new_v4().0.get_version_num(), 4);
    }

    #[test]
    fn warnings_are_omitted_when_empty() {
        let value = serde_json::to_value(Metadata::new("catalog", 0)).expect("json");
        assert!(value.get("warnings").is_none());
    }
}
