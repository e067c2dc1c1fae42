//! Incremental source query built from the persisted cursor.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value as JsonValue};
use triage_core::{CursorIdKind, CursorPosition};

use crate::mapper::{decode_identifier, decode_timestamp, lookup, SourceValue};

/// Names of the ordering fields in source documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFields {
    pub timestamp: String,
    pub id: String,
    /// Forces the JSON type of the id operand. When unset the kind recorded
    /// in the cursor is used.
    pub id_kind: Option<CursorIdKind>,
}

impl Default for SourceFields {
    fn default() -> Self {
        Self {
            timestamp: "createdAt".to_string(),
            id: "_id".to_string(),
            id_kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFilter {
    /// No cursor yet: first pass from the beginning.
    All,
    /// `ts > created_at OR (ts = created_at AND id > id)`.
    After {
        created_at: DateTime<Utc>,
        id: String,
        id_kind: Option<CursorIdKind>,
    },
    /// Cursor without a usable timestamp.
    IdAfter {
        id: String,
        id_kind: Option<CursorIdKind>,
    },
}

impl SourceFilter {
    pub fn from_cursor(cursor: Option<&CursorPosition>) -> Self {
        match cursor {
            None => SourceFilter::All,
            Some(CursorPosition {
                created_at: Some(created_at),
                external_id,
                id_kind,
            }) => SourceFilter::After {
                created_at: *created_at,
                id: external_id.clone(),
                id_kind: *id_kind,
            },
            Some(CursorPosition {
                created_at: None,
                external_id,
                id_kind,
            }) => SourceFilter::IdAfter {
                id: external_id.clone(),
                id_kind: *id_kind,
            },
        }
    }
}

/// Identifier order shared by the static source and cursor selection.
/// Integer ids sort before all other ids and compare as numbers; the rest
/// compare as text. Ties on the numeric value fall back to the text so the
/// order stays total (`"01"` before `"1"`).
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn looks_like_object_id(id: &str) -> bool {
    id.len() == 24 && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn numeric_operand(id: &str) -> JsonValue {
    if let Ok(n) = id.parse::<i64>() {
        return JsonValue::from(n);
    }
    id.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(id.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub filter: SourceFilter,
    pub fields: SourceFields,
    pub limit: usize,
}

impl SourceQuery {
    pub fn new(cursor: Option<&CursorPosition>, fields: SourceFields, limit: usize) -> Self {
        Self {
            filter: SourceFilter::from_cursor(cursor),
            fields,
            limit,
        }
    }

    /// Renders the cursor id with the JSON type the source stores it as.
    fn id_operand(&self, id: &str, recorded: Option<CursorIdKind>) -> JsonValue {
        let kind = self.fields.id_kind.or(recorded).unwrap_or_else(|| {
            if self.fields.id == "_id" && looks_like_object_id(id) {
                CursorIdKind::ObjectId
            } else {
                CursorIdKind::Text
            }
        });
        match kind {
            CursorIdKind::ObjectId => json!({ "$oid": id }),
            CursorIdKind::Number => numeric_operand(id),
            CursorIdKind::Text => JsonValue::String(id.to_string()),
        }
    }

    /// MongoDB-style filter document for remote sources.
    pub fn filter_document(&self) -> JsonValue {
        let ts_field = self.fields.timestamp.as_str();
        let id_field = self.fields.id.as_str();
        match &self.filter {
            SourceFilter::All => json!({}),
            SourceFilter::After { created_at, id, id_kind } => {
                let ts = json!({ "$date": created_at.to_rfc3339_opts(SecondsFormat::Millis, true) });
                let mut later = Map::new();
                later.insert(ts_field.to_string(), json!({ "$gt": ts.clone() }));
                let mut same_instant = Map::new();
                same_instant.insert(ts_field.to_string(), ts);
                same_instant.insert(id_field.to_string(), json!({ "$gt": self.id_operand(id, *id_kind) }));
                json!({ "$or": [JsonValue::Object(later), JsonValue::Object(same_instant)] })
            }
            SourceFilter::IdAfter { id, id_kind } => {
                let mut filter = Map::new();
                filter.insert(id_field.to_string(), json!({ "$gt": self.id_operand(id, *id_kind) }));
                JsonValue::Object(filter)
            }
        }
    }

    /// Ascending by (timestamp, id).
    pub fn sort_document(&self) -> JsonValue {
        let mut sort = Map::new();
        sort.insert(self.fields.timestamp.clone(), json!(1));
        sort.insert(self.fields.id.clone(), json!(1));
        JsonValue::Object(sort)
    }

    pub fn timestamp_of(&self, doc: &JsonValue) -> Option<DateTime<Utc>> {
        decode_timestamp(SourceValue::classify(lookup(doc, &self.fields.timestamp)))
    }

    pub fn id_of(&self, doc: &JsonValue) -> Option<String> {
        decode_identifier(SourceValue::classify(lookup(doc, &self.fields.id)))
    }

    /// Id of a document together with the JSON type it is stored as.
    pub fn typed_id_of(&self, doc: &JsonValue) -> Option<(String, CursorIdKind)> {
        let value = SourceValue::classify(lookup(doc, &self.fields.id));
        let kind = match value {
            SourceValue::Text(_) => CursorIdKind::Text,
            SourceValue::Number(_) | SourceValue::NumericText(_) => CursorIdKind::Number,
            SourceValue::ObjectId(_) => CursorIdKind::ObjectId,
            _ => return None,
        };
        decode_identifier(value).map(|id| (id, kind))
    }

    /// Evaluates the filter against one document, for in-process sources.
    pub fn matches(&self, doc: &JsonValue) -> bool {
        match &self.filter {
            SourceFilter::All => true,
            SourceFilter::After { created_at, id, .. } => match self.timestamp_of(doc) {
                Some(ts) if ts > *created_at => true,
                Some(ts) if ts == *created_at => self
                    .id_of(doc)
                    .is_some_and(|doc_id| compare_ids(&doc_id, id) == Ordering::Greater),
                _ => false,
            },
            SourceFilter::IdAfter { id, .. } => self
                .id_of(doc)
                .is_some_and(|doc_id| compare_ids(&doc_id, id) == Ordering::Greater),
        }
    }

    /// Sort order of [`SourceQuery::sort_document`]; missing timestamps and ids
    /// sort first, as they do in the source collection.
    pub fn compare_documents(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        self.timestamp_of(a)
            .cmp(&self.timestamp_of(b))
            .then_with(|| match (self.id_of(a), self.id_of(b)) {
                (Some(x), Some(y)) => compare_ids(&x, &y),
                (x, y) => x.cmp(&y),
            })
    }
}
