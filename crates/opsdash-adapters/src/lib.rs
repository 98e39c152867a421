//! Row adapters: turn uploaded JSON rows from each data source into
//! [`RawEvent`]s with canonical field names.
//!
//! Uploads come from several historical exports, so every canonical field
//! accepts a fixed list of header spellings. Headers are compared after
//! lower-casing and dropping non-alphanumerics (`Client ID`, `clientId` and
//! `client_id` are the same header).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use opsdash_core::{parse_timestamp, RawEvent, UNSPECIFIED};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "opsdash-adapters";

pub mod fields {
    //! Canonical field names shared by adapters, merge profiles and dashboard rules.

    pub const CLIENT_ID: &str = "client_id";
    pub const MAID_ID: &str = "maid_id";
    pub const CONTRACT_ID: &str = "contract_id";
    pub const CLIENT_NAME: &str = "client_name";
    pub const MAID_NAME: &str = "maid_name";
    pub const CONTRACT_TYPE: &str = "contract_type";
    pub const SKILL: &str = "skill";
    pub const MESSAGE: &str = "message";
    pub const COUNTRIES: &str = "countries";
    pub const CONVERSATION_IDS: &str = "conversation_ids";
    pub const PROSPECT_SERVICES: &str = "prospect_services";
    pub const CONVERTED_SERVICES: &str = "converted_services";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Conversation,
    OecSale,
    Complaint,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Conversation => "conversation",
            SourceKind::OecSale => "oec_sale",
            SourceKind::Complaint => "complaint",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_kind} row {index} is not a JSON object")]
    NotAnObject { source_kind: &'static str, index: usize },
    #[error("expected a JSON array of rows, got {0}")]
    NotAnArray(&'static str),
}

/// Maps one uploaded row onto a [`RawEvent`].
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn to_event(&self, row: &Map<String, JsonValue>) -> RawEvent;

    fn normalize_rows(&self, rows: &[JsonValue]) -> Result<Vec<RawEvent>, AdapterError> {
        rows.iter()
            .enumerate()
            .map(|(index, row)| {
                row.as_object()
                    .map(|obj| self.to_event(obj))
                    .ok_or(AdapterError::NotAnObject {
                        source_kind: self.kind().as_str(),
                        index,
                    })
            })
            .collect()
    }
}

pub fn adapter_for(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::Conversation => Box::new(ConversationAdapter),
        SourceKind::OecSale => Box::new(OecSaleAdapter),
        SourceKind::Complaint => Box::new(ComplaintAdapter),
    }
}

/// Accepts either a bare array of rows or an object wrapping one under
/// `rows`, `records`, `data` or `conversations`.
pub fn rows_from_payload(payload: &JsonValue) -> Result<&[JsonValue], AdapterError> {
    if let Some(rows) = payload.as_array() {
        return Ok(rows);
    }
    if let Some(obj) = payload.as_object() {
        for key in ["rows", "records", "data", "conversations"] {
            if let Some(rows) = obj.get(key).and_then(JsonValue::as_array) {
                return Ok(rows);
            }
        }
        return Err(AdapterError::NotAnArray("object without a rows array"));
    }
    Err(AdapterError::NotAnArray(json_kind(payload)))
}

pub fn load_rows_file(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let payload: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let rows = rows_from_payload(&payload).with_context(|| format!("reading rows of {}", path.display()))?;
    Ok(rows.to_vec())
}

/// Stable id for a row without its own id: UUIDv5 over its canonical JSON.
pub fn row_fingerprint(kind: SourceKind, row: &Map<String, JsonValue>) -> String {
    // serde_json::Map is ordered by key unless preserve_order is enabled,
    // so the encoding is canonical for equal rows.
    let canonical = serde_json::to_string(row).unwrap_or_default();
    let source = format!("{}:{}", kind.as_str(), canonical);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes()).to_string()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Finds the first populated value among the accepted header spellings.
fn lookup<'a>(row: &'a Map<String, JsonValue>, aliases: &[&str]) -> Option<&'a JsonValue> {
    aliases.iter().find_map(|alias| {
        row.iter()
            .find(|(key, value)| normalize_header(key) == *alias && !value.is_null())
            .map(|(_, value)| value)
    })
}

fn lookup_text(row: &Map<String, JsonValue>, aliases: &[&str]) -> Option<String> {
    lookup(row, aliases).and_then(scalar_text)
}

/// Message bodies arrive as a string, a list of strings, or a list of
/// `{sender, text|content|message}` objects.
fn lookup_message(row: &Map<String, JsonValue>, aliases: &[&str]) -> Option<String> {
    let value = lookup(row, aliases)?;
    match value {
        JsonValue::Array(items) => {
            let lines = items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::Object(obj) => {
                        let body = lookup_text(obj, &["text", "content", "message", "body"])?;
                        Some(match lookup_text(obj, &["sender", "from", "role", "author"]) {
                            Some(sender) => format!("{sender}: {body}"),
                            None => body,
                        })
                    }
                    other => scalar_text(other),
                })
                .collect::<Vec<_>>();
            text_or_none(lines.join("\n"))
        }
        other => scalar_text(other),
    }
}

/// Comma/semicolon separated strings or arrays; blanks and `unspecified` dropped.
fn lookup_list(row: &Map<String, JsonValue>, aliases: &[&str]) -> Vec<String> {
    let Some(value) = lookup(row, aliases) else {
        return Vec::new();
    };
    let raw: Vec<String> = match value {
        JsonValue::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other)
            .map(|s| s.split([',', ';']).map(ToString::to_string).collect())
            .unwrap_or_default(),
    };
    raw.into_iter()
        .filter_map(text_or_none)
        .filter(|v| !v.eq_ignore_ascii_case(UNSPECIFIED))
        .collect()
}

/// `CC`/`MV` and their long spellings collapse to the short code.
pub fn normalize_contract_type(value: &str) -> Option<String> {
    let compact = normalize_header(value);
    match compact.as_str() {
        "" => None,
        "cc" | "clientcontract" | "clientsponsored" => Some("CC".to_string()),
        "mv" | "maidvisa" | "maidsponsored" => Some("MV".to_string()),
        _ => text_or_none(value.to_ascii_uppercase()),
    }
}

const CLIENT_ID: &[&str] = &["clientid", "customerid", "client"];
const MAID_ID: &[&str] = &["maidid", "housemaidid", "maid", "housemaid", "workerid"];
const CONTRACT_ID: &[&str] = &["contractid", "contract", "contractno", "contractnumber"];
const CLIENT_NAME: &[&str] = &["clientname", "customername"];
const MAID_NAME: &[&str] = &["maidname", "housemaidname", "workername"];
const CONTRACT_TYPE: &[&str] = &["contracttype", "contracttypecode"];
const TIMESTAMP: &[&str] = &[
    "timestamp",
    "createdat",
    "datetime",
    "messagetime",
    "starttime",
    "time",
    "date",
];
const COUNTRIES: &[&str] = &["countries", "country", "nationality", "nationalities"];

fn base_event(row: &Map<String, JsonValue>) -> RawEvent {
    let mut event = RawEvent::new();
    for (name, aliases) in [
        (fields::CLIENT_ID, CLIENT_ID),
        (fields::MAID_ID, MAID_ID),
        (fields::CONTRACT_ID, CONTRACT_ID),
    ] {
        if let Some(value) = lookup_text(row, aliases) {
            event.identifiers.insert(name.to_string(), value);
        }
    }
    // Unparseable timestamps stay `None`; the grouper substitutes "now".
    event.timestamp = lookup_text(row, TIMESTAMP).and_then(|t| parse_timestamp(&t));

    for (name, aliases) in [(fields::CLIENT_NAME, CLIENT_NAME), (fields::MAID_NAME, MAID_NAME)] {
        if let Some(value) = lookup_text(row, aliases) {
            event.scalars.insert(name.to_string(), value);
        }
    }
    if let Some(contract_type) = lookup_text(row, CONTRACT_TYPE).and_then(|v| normalize_contract_type(&v)) {
        event
            .scalars
            .insert(fields::CONTRACT_TYPE.to_string(), contract_type);
    }
    // Contract id doubles as the household key during aggregation.
    if let Some(contract_id) = event.identifier(fields::CONTRACT_ID).map(ToString::to_string) {
        event
            .scalars
            .insert(fields::CONTRACT_ID.to_string(), contract_id);
    }

    let countries = lookup_list(row, COUNTRIES);
    if !countries.is_empty() {
        event.sets.insert(fields::COUNTRIES.to_string(), countries);
    }
    event
}

/// Chat transcripts from the messaging export.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationAdapter;

impl SourceAdapter for ConversationAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Conversation
    }

    fn to_event(&self, row: &Map<String, JsonValue>) -> RawEvent {
        let mut event = base_event(row);
        let record_id = lookup_text(row, &["conversationid", "chatid", "id"])
            .unwrap_or_else(|| row_fingerprint(self.kind(), row));
        event
            .sets
            .insert(fields::CONVERSATION_IDS.to_string(), vec![record_id.clone()]);
        event.record_id = Some(record_id);

        if let Some(skill) = lookup_text(row, &["skill", "queue", "category"]) {
            event.scalars.insert(fields::SKILL.to_string(), skill.clone());
            event.category = Some(skill);
        }
        if let Some(message) = lookup_message(row, &["messages", "message", "transcript", "text", "content"]) {
            event.texts.insert(fields::MESSAGE.to_string(), message);
        }
        event
    }
}

/// Overseas-employment-certificate sale rows from the sales export.
#[derive(Debug, Clone, Copy, Default)]
pub struct OecSaleAdapter;

pub const DEFAULT_OEC_TYPE: &str = "Overseas Employment Certificate";

impl SourceAdapter for OecSaleAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::OecSale
    }

    fn to_event(&self, row: &Map<String, JsonValue>) -> RawEvent {
        let mut event = base_event(row);
        if event.timestamp.is_none() {
            event.timestamp = lookup_text(row, &["saledate", "requestdate", "orderdate"])
                .and_then(|t| parse_timestamp(&t));
        }
        event.record_id = Some(
            lookup_text(row, &["saleid", "requestid", "id"])
                .unwrap_or_else(|| row_fingerprint(self.kind(), row)),
        );
        event.category = Some(
            lookup_text(row, &["type", "service", "servicetype", "saletype"])
                .unwrap_or_else(|| DEFAULT_OEC_TYPE.to_string()),
        );
        event
    }
}

/// Complaint records feeding the P&L report.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplaintAdapter;

impl SourceAdapter for ComplaintAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Complaint
    }

    fn to_event(&self, row: &Map<String, JsonValue>) -> RawEvent {
        let mut event = base_event(row);
        if event.timestamp.is_none() {
            event.timestamp = lookup_text(row, &["creationdate", "complaintdate", "reportedat"])
                .and_then(|t| parse_timestamp(&t));
        }
        event.record_id = Some(
            lookup_text(row, &["complaintid", "ticketid", "id"])
                .unwrap_or_else(|| row_fingerprint(self.kind(), row)),
        );
        event.category = lookup_text(row, &["complainttype", "type", "category", "subtype"]);
        if let Some(notes) = lookup_text(row, &["description", "notes", "comment", "details"]) {
            event.texts.insert(fields::MESSAGE.to_string(), notes);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn obj(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn header_spellings_collapse_to_canonical_fields() {
        let a = ConversationAdapter.to_event(&obj(json!({
            "Client ID": "C-1", "housemaidId": 77, "Contract Type": "maid visa",
            "conversationId": "conv-1", "Date": "2026-01-10 08:00:00"
        })));
        assert_eq!(a.identifier(fields::CLIENT_ID), Some("C-1"));
        assert_eq!(a.identifier(fields::MAID_ID), Some("77"));
        assert_eq!(a.scalar(fields::CONTRACT_TYPE), Some("MV"));
        assert_eq!(a.record_id(), Some("conv-1"));
        assert_eq!(a.timestamp, Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).single());
    }

    #[test]
    fn message_lists_are_flattened_in_order() {
        let event = ConversationAdapter.to_event(&obj(json!({
            "id": "c-9",
            "messages": [
                {"sender": "client", "text": "Need an OEC"},
                {"sender": "agent", "content": "Sure"},
                "plain line"
            ]
        })));
        assert_eq!(
            event.texts.get(fields::MESSAGE).map(String::as_str),
            Some("client: Need an OEC\nagent: Sure\nplain line")
        );
    }

    #[test]
    fn countries_drop_blanks_and_the_unspecified_sentinel() {
        let event = ComplaintAdapter.to_event(&obj(json!({"country": "Philippines; ; Unspecified, Kenya"})));
        assert_eq!(
            event.sets.get(fields::COUNTRIES).cloned().unwrap(),
            vec!["Philippines".to_string(), "Kenya".to_string()]
        );
    }

    #[test]
    fn rows_without_ids_get_a_stable_fingerprint() {
        let row = obj(json!({"client": "C-2", "type": "OEC", "date": "2026-01-10"}));
        let first = OecSaleAdapter.to_event(&row);
        let second = OecSaleAdapter.to_event(&row);
        assert!(first.record_id().is_some());
        assert_eq!(first.record_id, second.record_id);
        assert_ne!(first.record_id, Some(row_fingerprint(SourceKind::Complaint, &row)));
    }

    #[test]
    fn bad_timestamps_are_left_for_the_grouper() {
        let event = OecSaleAdapter.to_event(&obj(json!({"client_id": "C-3", "date": "soon"})));
        assert_eq!(event.timestamp, None);
        assert_eq!(event.category(), Some(DEFAULT_OEC_TYPE));
    }

    #[test]
    fn payload_shapes_and_non_object_rows() {
        let wrapped = json!({"rows": [{"id": 1}]});
        assert_eq!(rows_from_payload(&wrapped).unwrap().len(), 1);
        assert!(rows_from_payload(&json!("nope")).is_err());

        let adapter = adapter_for(SourceKind::Complaint);
        let err = adapter.normalize_rows(&[json!({"id": 1}), json!(3)]).unwrap_err();
        assert!(matches!(err, AdapterError::NotAnObject { index: 1, .. }));
    }

    #[test]
    fn contract_types_normalise() {
        assert_eq!(normalize_contract_type("cc").as_deref(), Some("CC"));
        assert_eq!(normalize_contract_type("Client Contract").as_deref(), Some("CC"));
        assert_eq!(normalize_contract_type("  ").as_deref(), None);
        assert_eq!(normalize_contract_type("temp").as_deref(), Some("TEMP"));
    }
}
