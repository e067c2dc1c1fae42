//! Core domain model for the sales triage backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "triage-core";

/// Status given to newly ingested sales whose source status did not map.
pub const DEFAULT_INGEST_STATUS: SaleStatus = SaleStatus::Received;

/// Operator-facing lifecycle status of a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    Received,
    Completed,
    Delayed,
    Problem,
}

impl SaleStatus {
    pub const ALL: [SaleStatus; 4] = [
        SaleStatus::Received,
        SaleStatus::Completed,
        SaleStatus::Delayed,
        SaleStatus::Problem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Received => "RECEIVED",
            SaleStatus::Completed => "COMPLETED",
            SaleStatus::Delayed => "DELAYED",
            SaleStatus::Problem => "PROBLEM",
        }
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sale status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SaleStatus {
    type Err = UnknownStatus;

    /// Parses the canonical name only. Source synonyms are handled by the mapper.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaleStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Mapper output: one source document reduced to the fields ingestion owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSale {
    pub external_id: String,
    pub listing_id: Option<String>,
    pub event_id: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub buyer_email: Option<String>,
    pub status: Option<SaleStatus>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub raw: JsonValue,
}

/// Persisted sale row.
///
/// `status`, `delayed_until`, `problem_reason` and `filled_by` are operational
/// fields: only operator actions write them after the row is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub external_id: String,
    pub listing_id: Option<String>,
    pub event_id: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub buyer_email: Option<String>,
    pub raw: JsonValue,
    pub status: SaleStatus,
    pub delayed_until: Option<DateTime<Utc>>,
    pub problem_reason: Option<String>,
    pub filled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub sync_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
}

/// A sale together with its tags and comments (oldest comment first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleDetail {
    pub sale: Sale,
    pub tags: Vec<Tag>,
    pub comments: Vec<Comment>,
}

/// Operator edit of the status fields, guarded by the `updated_at` the
/// operator last saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: SaleStatus,
    #[serde(default)]
    pub delayed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub problem_reason: Option<String>,
    pub expected_updated_at: DateTime<Utc>,
}

/// JSON type the cursor id had in the source document. Range filters only
/// match values of the same type, so the query renders the id with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorIdKind {
    Text,
    Number,
    ObjectId,
}

impl CursorIdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorIdKind::Text => "text",
            CursorIdKind::Number => "number",
            CursorIdKind::ObjectId => "object_id",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Some(CursorIdKind::Text),
            "number" | "int" | "long" => Some(CursorIdKind::Number),
            "object_id" | "objectid" | "oid" => Some(CursorIdKind::ObjectId),
            _ => None,
        }
    }
}

/// High-water mark of incremental ingestion, stored as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub created_at: Option<DateTime<Utc>>,
    pub external_id: String,
    /// Unknown for cursors written by hand or before the kind was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_kind: Option<CursorIdKind>,
}

impl CursorPosition {
    pub fn new(created_at: Option<DateTime<Utc>>, external_id: impl Into<String>) -> Self {
        Self {
            created_at,
            external_id: external_id.into(),
            id_kind: None,
        }
    }

    pub fn with_id_kind(mut self, kind: CursorIdKind) -> Self {
        self.id_kind = Some(kind);
        self
    }

    pub fn encode(&self) -> String {
        let mut value = serde_json::json!({
            "created_at": self.created_at.map(|ts| ts.to_rfc3339()),
            "external_id": self.external_id,
        });
        if let (Some(kind), Some(map)) = (self.id_kind, value.as_object_mut()) {
            map.insert("id_kind".to_string(), JsonValue::from(kind.as_str()));
        }
        value.to_string()
    }

    /// Decodes a stored cursor value. Anything that is not the JSON form is
    /// treated as a bare external id.
    pub fn decode(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<CursorPosition>(trimmed) {
            Ok(position) if !position.external_id.trim().is_empty() => Some(position),
            Ok(_) => None,
            Err(_) => Some(Self::new(None, trimmed)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_encoding_survives_decode() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).single().unwrap();
        let cursor = CursorPosition::new(Some(ts), "B");
        assert_eq!(CursorPosition::decode(&cursor.encode()), Some(cursor));
    }

    #[test]
    fn cursor_id_kind_is_recorded_when_known() {
        let cursor = CursorPosition::new(None, "991").with_id_kind(CursorIdKind::Number);
        let encoded = cursor.encode();
        assert!(encoded.contains(r#""id_kind":"number""#));
        assert_eq!(CursorPosition::decode(&encoded), Some(cursor));

        let legacy = CursorPosition::decode(r#"{"created_at":null,"external_id":"991"}"#).unwrap();
        assert_eq!(legacy.id_kind, None);
        assert!(!CursorPosition::new(None, "A").encode().contains("id_kind"));
        assert_eq!(CursorIdKind::parse(" ObjectId "), Some(CursorIdKind::ObjectId));
        assert_eq!(CursorIdKind::parse("uuid"), None);
    }

    #[test]
    fn legacy_cursor_value_is_an_id_only_cursor() {
        let cursor = CursorPosition::decode(" 65f0c0ffee0000000000abcd ").unwrap();
        assert_eq!(cursor.created_at, None);
        assert_eq!(cursor.external_id, "65f0c0ffee0000000000abcd");
        assert_eq!(CursorPosition::decode("   "), None);
        assert_eq!(
            CursorPosition::decode(r#"{"created_at":null,"external_id":""}"#),
            None
        );
    }

    #[test]
    fn canonical_status_names_parse_case_insensitively() {
        assert_eq!("problem".parse::<SaleStatus>(), Ok(SaleStatus::Problem));
        assert_eq!(" DELAYED ".parse::<SaleStatus>(), Ok(SaleStatus::Delayed));
        assert!("SOLD".parse::<SaleStatus>().is_err());
        assert_eq!(
            serde_json::to_value(SaleStatus::Completed).unwrap(),
            serde_json::json!("COMPLETED")
        );
    }
}
