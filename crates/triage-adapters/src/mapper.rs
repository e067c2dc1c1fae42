//! Source record mapper: one loosely typed source document in, one
//! [`NormalizedSale`] out, or a rejection when no external id can be found.
//!
//! Source documents mix plain JSON with extended-JSON wrappers (`{"$oid": ..}`,
//! `{"$date": ..}`, `{"$numberDecimal": ..}`). Every field goes through
//! [`SourceValue::classify`] first and then a per-type decoder that returns
//! `None` for anything it cannot read. Only a missing identifier rejects a record.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;
use triage_core::{NormalizedSale, SaleStatus};

/// Identifier candidates, highest priority first. Used by both the live
/// poller and the file import.
pub const IDENTIFIER_FIELDS: [&str; 4] = ["_id", "ticketGroupId", "listingId", "externalId"];

const LISTING_ID_FIELDS: [&str; 2] = ["listingId", "listing_id"];
const EVENT_ID_FIELDS: [&str; 2] = ["eventId", "event_id"];
const QUANTITY_FIELDS: [&str; 3] = ["quantity", "qty", "ticketQuantity"];
const PRICE_FIELDS: [&str; 3] = ["price", "totalPrice", "amount"];
const CURRENCY_FIELDS: [&str; 2] = ["currency", "currencyCode"];
const BUYER_EMAIL_FIELDS: [&str; 3] = ["buyerEmail", "buyer.email", "email"];
const STATUS_FIELDS: [&str; 3] = ["status", "saleStatus", "state"];
const CREATED_AT_FIELDS: [&str; 3] = ["createdAt", "created_at", "dateCreated"];
const UPDATED_AT_FIELDS: [&str; 3] = ["updatedAt", "updated_at", "lastUpdated"];

const STATUS_SYNONYMS: &[(&str, SaleStatus)] = &[
    ("RECEIVED", SaleStatus::Received),
    ("INITIATED", SaleStatus::Received),
    ("PENDING", SaleStatus::Received),
    ("NEW", SaleStatus::Received),
    ("OPEN", SaleStatus::Received),
    ("CREATED", SaleStatus::Received),
    ("COMPLETED", SaleStatus::Completed),
    ("COMPLETE", SaleStatus::Completed),
    ("SOLD", SaleStatus::Completed),
    ("FULFILLED", SaleStatus::Completed),
    ("DELIVERED", SaleStatus::Completed),
    ("CLOSED", SaleStatus::Completed),
    ("DELAYED", SaleStatus::Delayed),
    ("LATE", SaleStatus::Delayed),
    ("ON_HOLD", SaleStatus::Delayed),
    ("HOLD", SaleStatus::Delayed),
    ("BACKORDERED", SaleStatus::Delayed),
    ("PROBLEM", SaleStatus::Problem),
    ("FAILED", SaleStatus::Problem),
    ("ERROR", SaleStatus::Problem),
    ("DISPUTED", SaleStatus::Problem),
    ("CANCELLED", SaleStatus::Problem),
    ("CANCELED", SaleStatus::Problem),
    ("REJECTED", SaleStatus::Problem),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("source record is not a JSON object")]
    NotAnObject,
    #[error("source record has no usable external identifier (tried _id, ticketGroupId, listingId, externalId)")]
    MissingIdentifier,
}

/// A source value with its extended-JSON wrapper identified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceValue<'a> {
    /// Missing field or JSON null.
    Absent,
    Text(&'a str),
    Number(&'a Number),
    /// Payload of `{"$oid": ..}`.
    ObjectId(&'a str),
    /// Payload of `{"$date": ..}`, still undecoded.
    Date(&'a JsonValue),
    /// Payload of `{"$numberDecimal" | "$numberDouble" | "$numberInt" | "$numberLong": ..}`.
    NumericText(&'a str),
    /// Booleans, arrays and objects of unknown shape.
    Other,
}

impl<'a> SourceValue<'a> {
    pub fn classify(value: Option<&'a JsonValue>) -> Self {
        match value {
            None | Some(JsonValue::Null) => SourceValue::Absent,
            Some(JsonValue::String(s)) => SourceValue::Text(s),
            Some(JsonValue::Number(n)) => SourceValue::Number(n),
            Some(JsonValue::Object(map)) if map.len() == 1 => match map.iter().next() {
                Some((key, inner)) => Self::classify_wrapper(key, inner),
                None => SourceValue::Other,
            },
            Some(_) => SourceValue::Other,
        }
    }

    fn classify_wrapper(key: &str, inner: &'a JsonValue) -> Self {
        match (key, inner) {
            ("$oid", JsonValue::String(s)) => SourceValue::ObjectId(s),
            ("$date", inner) => SourceValue::Date(inner),
            (
                "$numberDecimal" | "$numberDouble" | "$numberInt" | "$numberLong",
                JsonValue::String(s),
            ) => SourceValue::NumericText(s),
            (
                "$numberDecimal" | "$numberDouble" | "$numberInt" | "$numberLong",
                JsonValue::Number(n),
            ) => SourceValue::Number(n),
            _ => SourceValue::Other,
        }
    }
}

/// Follows a dotted path (`buyer.email`) through nested objects.
pub fn lookup<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn decode_identifier(value: SourceValue<'_>) -> Option<String> {
    match value {
        SourceValue::Text(s) | SourceValue::ObjectId(s) | SourceValue::NumericText(s) => {
            non_empty(s)
        }
        SourceValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i.to_string());
            }
            if let Some(u) = n.as_u64() {
                return Some(u.to_string());
            }
            let f = n.as_f64()?;
            if !f.is_finite() {
                return None;
            }
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Some((f as i64).to_string())
            } else {
                Some(n.to_string())
            }
        }
        SourceValue::Absent | SourceValue::Date(_) | SourceValue::Other => None,
    }
}

pub fn decode_number(value: SourceValue<'_>) -> Option<f64> {
    let parsed = match value {
        SourceValue::Number(n) => n.as_f64(),
        SourceValue::Text(s) | SourceValue::NumericText(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Integer fields truncate toward zero and must fit in an `i32`.
pub fn decode_integer(value: SourceValue<'_>) -> Option<i32> {
    let n = decode_number(value)?.trunc();
    if n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX) {
        Some(n as i32)
    } else {
        None
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn timestamp_from_millis(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis.trunc() as i64)
}

/// Accepts ISO/RFC 3339 strings, epoch milliseconds, and `{"$date": ..}`
/// wrapping either of them or a `{"$numberLong": ..}`.
pub fn decode_timestamp(value: SourceValue<'_>) -> Option<DateTime<Utc>> {
    match value {
        SourceValue::Text(s) => parse_timestamp_text(s),
        SourceValue::Number(n) => timestamp_from_millis(n.as_f64()?),
        SourceValue::Date(inner) => match SourceValue::classify(Some(inner)) {
            SourceValue::Text(s) => parse_timestamp_text(s),
            SourceValue::Number(n) => timestamp_from_millis(n.as_f64()?),
            SourceValue::NumericText(s) => timestamp_from_millis(s.trim().parse::<f64>().ok()?),
            _ => None,
        },
        _ => None,
    }
}

pub fn decode_text(value: SourceValue<'_>) -> Option<String> {
    match value {
        SourceValue::Text(s) => non_empty(s),
        _ => None,
    }
}

/// Maps a source status code onto the canonical statuses. Unknown codes are
/// `None`; the store picks the default for new rows.
pub fn normalize_status(code: &str) -> Option<SaleStatus> {
    let key = code
        .trim()
        .to_ascii_uppercase()
        .replace(['-', ' '], "_");
    STATUS_SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == key)
        .map(|(_, status)| *status)
}

fn first_decoded<T>(
    doc: &JsonValue,
    candidates: &[&str],
    decode: impl Fn(SourceValue<'_>) -> Option<T>,
) -> Option<T> {
    candidates
        .iter()
        .find_map(|field| decode(SourceValue::classify(lookup(doc, field))))
}

pub fn external_id_of(doc: &JsonValue) -> Option<String> {
    first_decoded(doc, &IDENTIFIER_FIELDS, decode_identifier)
}

pub fn map_record(raw: &JsonValue) -> Result<NormalizedSale, Rejected> {
    if !raw.is_object() {
        return Err(Rejected::NotAnObject);
    }
    let external_id = external_id_of(raw).ok_or(Rejected::MissingIdentifier)?;

    Ok(NormalizedSale {
        external_id,
        listing_id: first_decoded(raw, &LISTING_ID_FIELDS, decode_identifier),
        event_id: first_decoded(raw, &EVENT_ID_FIELDS, decode_identifier),
        quantity: first_decoded(raw, &QUANTITY_FIELDS, decode_integer),
        price: first_decoded(raw, &PRICE_FIELDS, decode_number),
        currency: first_decoded(raw, &CURRENCY_FIELDS, decode_text)
            .map(|c| c.to_ascii_uppercase()),
        buyer_email: first_decoded(raw, &BUYER_EMAIL_FIELDS, decode_text)
            .map(|e| e.to_ascii_lowercase()),
        status: first_decoded(raw, &STATUS_FIELDS, |v| {
            decode_text(v).and_then(|code| normalize_status(&code))
        }),
        source_created_at: first_decoded(raw, &CREATED_AT_FIELDS, decode_timestamp),
        source_updated_at: first_decoded(raw, &UPDATED_AT_FIELDS, decode_timestamp),
        raw: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn identifier_priority_prefers_object_id() {
        let doc = json!({
            "_id": { "$oid": " 65f0c0ffee0000000000abcd " },
            "ticketGroupId": 991,
            "listingId": "L-7",
        });
        assert_eq!(external_id_of(&doc).as_deref(), Some("65f0c0ffee0000000000abcd"));
    }

    #[test]
    fn identifier_falls_through_blank_and_unusable_candidates() {
        let doc = json!({ "_id": "   ", "ticketGroupId": 4123.0, "listingId": "L-7" });
        assert_eq!(external_id_of(&doc).as_deref(), Some("4123"));

        let doc = json!({ "_id": [1, 2], "ticketGroupId": null, "externalId": "ext-9" });
        assert_eq!(external_id_of(&doc).as_deref(), Some("ext-9"));

        let doc = json!({ "ticketGroupId": { "$numberLong": "9007199254740993" } });
        assert_eq!(external_id_of(&doc).as_deref(), Some("9007199254740993"));
    }

    #[test]
    fn records_without_identifier_are_rejected() {
        assert_eq!(
            map_record(&json!({ "status": "SOLD", "price": 10 })),
            Err(Rejected::MissingIdentifier)
        );
        assert_eq!(map_record(&json!(["not", "a", "record"])), Err(Rejected::NotAnObject));
    }

    #[test]
    fn numbers_decode_permissively() {
        let n = |v: JsonValue| decode_number(SourceValue::classify(Some(&v)));
        assert_eq!(n(json!(12.5)), Some(12.5));
        assert_eq!(n(json!(" 99.90 ")), Some(99.9));
        assert_eq!(n(json!({ "$numberDecimal": "120.25" })), Some(120.25));
        assert_eq!(n(json!("twelve")), None);
        assert_eq!(n(json!("NaN")), None);
        assert_eq!(n(json!("inf")), None);
        assert_eq!(n(json!(true)), None);

        let i = |v: JsonValue| decode_integer(SourceValue::classify(Some(&v)));
        assert_eq!(i(json!(3.9)), Some(3));
        assert_eq!(i(json!(-2.7)), Some(-2));
        assert_eq!(i(json!("4")), Some(4));
        assert_eq!(i(json!(1e12)), None);
    }

    #[test]
    fn timestamps_decode_from_every_supported_shape() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().unwrap();
        let t = |v: JsonValue| decode_timestamp(SourceValue::classify(Some(&v)));

        assert_eq!(t(json!("2026-03-01T10:00:00Z")), Some(expected));
        assert_eq!(t(json!("2026-03-01T12:00:00+02:00")), Some(expected));
        assert_eq!(t(json!("2026-03-01T10:00:00.000")), Some(expected));
        assert_eq!(t(json!("2026-03-01 10:00:00")), Some(expected));
        assert_eq!(t(json!({ "$date": "2026-03-01T10:00:00.000Z" })), Some(expected));
        assert_eq!(t(json!({ "$date": expected.timestamp_millis() })), Some(expected));
        assert_eq!(
            t(json!({ "$date": { "$numberLong": expected.timestamp_millis().to_string() } })),
            Some(expected)
        );
        assert_eq!(t(json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(
            t(json!("2026-03-01")),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single()
        );
        assert_eq!(t(json!("yesterday")), None);
        assert_eq!(t(json!({ "$date": "soon" })), None);
        assert_eq!(t(json!(f64::MAX)), None);
    }

    #[test]
    fn status_synonyms_normalize() {
        assert_eq!(normalize_status("SOLD"), Some(SaleStatus::Completed));
        assert_eq!(normalize_status("initiated"), Some(SaleStatus::Received));
        assert_eq!(normalize_status("on-hold"), Some(SaleStatus::Delayed));
        assert_eq!(normalize_status("On Hold"), Some(SaleStatus::Delayed));
        assert_eq!(normalize_status("Cancelled"), Some(SaleStatus::Problem));
        assert_eq!(normalize_status("WAITING_FOR_GODOT"), None);
    }

    #[test]
    fn full_record_maps_all_fields_and_keeps_raw_payload() {
        let raw = json!({
            "_id": { "$oid": "65f0c0ffee0000000000abcd" },
            "listingId": 5501,
            "eventId": "EV-9",
            "quantity": { "$numberInt": "2" },
            "price": { "$numberDecimal": "310.50" },
            "currency": "usd",
            "buyer": { "email": " Buyer@Example.COM " },
            "status": "SOLD",
            "createdAt": { "$date": "2026-03-01T10:00:00Z" },
            "updatedAt": "not a date",
        });
        let sale = map_record(&raw).unwrap();
        assert_eq!(sale.external_id, "65f0c0ffee0000000000abcd");
        assert_eq!(sale.listing_id.as_deref(), Some("5501"));
        assert_eq!(sale.event_id.as_deref(), Some("EV-9"));
        assert_eq!(sale.quantity, Some(2));
        assert_eq!(sale.price, Some(310.5));
        assert_eq!(sale.currency.as_deref(), Some("USD"));
        assert_eq!(sale.buyer_email.as_deref(), Some("buyer@example.com"));
        assert_eq!(sale.status, Some(SaleStatus::Completed));
        assert_eq!(
            sale.source_created_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single()
        );
        assert_eq!(sale.source_updated_at, None);
        assert_eq!(sale.raw, raw);
    }

    #[test]
    fn unknown_status_and_bad_fields_become_none() {
        let sale = map_record(&json!({
            "externalId": "X-1",
            "status": "MYSTERY",
            "price": "free",
            "quantity": [],
        }))
        .unwrap();
        assert_eq!(sale.status, None);
        assert_eq!(sale.price, None);
        assert_eq!(sale.quantity, None);
        assert_eq!(sale.source_created_at, None);
    }
}
