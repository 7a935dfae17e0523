//! Core domain model for flattrack: chat messages, extracted listing attributes,
//! persisted records and the extraction schema.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub mod vocab;

pub const CRATE_NAME: &str = "flattrack-core";

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\p{Extended_Pictographic}\x{1F1E6}-\x{1F1FF}\x{1F3FB}-\x{1F3FF}\x{200D}\x{FE0F}\x{20E3}\x{E0020}-\x{E007F}]",
    )
        .expect("emoji pattern compiles")
});

/// Strip non-breaking spaces and emoji from message text and trim the ends.
pub fn normalize_text(raw: &str) -> String {
    let spaced = raw.replace('\u{a0}', " ");
    EMOJI.replace_all(&spaced, "").trim().to_string()
}

/// A chat message as handed over by the message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    pub timestamp: DateTime<FixedOffset>,
    pub text: Option<String>,
    pub sender_first_name: Option<String>,
    pub sender_last_name: Option<String>,
}

/// A message after text normalization, scoped to one ingest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedMessage {
    pub id: i64,
    pub timestamp: DateTime<FixedOffset>,
    pub text: String,
    pub sender_name: String,
}

impl CleanedMessage {
    pub fn from_raw(raw: &RawMessage) -> Self {
        let sender_name = [&raw.sender_first_name, &raw.sender_last_name]
            .into_iter()
            .filter_map(|part| part.as_deref().map(str::trim))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            id: raw.id,
            timestamp: raw.timestamp,
            text: normalize_text(raw.text.as_deref().unwrap_or_default()),
            sender_name,
        }
    }

    /// Wall-clock timestamp with the zone offset dropped, as stored.
    pub fn naive_timestamp(&self) -> NaiveDateTime {
        self.timestamp.naive_local()
    }
}

/// One extracted attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
    Empty,
}

impl AttributeValue {
    /// Total conversion from arbitrary JSON; nested objects are kept as their JSON text.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Empty,
            JsonValue::Bool(b) => Self::Boolean(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Empty),
            },
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(items) => Self::List(
                items
                    .into_iter()
                    .filter(|item| !item.is_null())
                    .map(|item| match item {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            obj @ JsonValue::Object(_) => Self::Text(obj.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Display form used by read-side renderers.
    pub fn display(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(", "),
            Self::Empty => String::new(),
        }
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        JsonValue::deserialize(deserializer).map(Self::from_json)
    }
}

/// Field name to extracted value. May be empty when extraction found nothing.
pub type AttributeMapping = BTreeMap<String, AttributeValue>;

/// Build an attribute mapping from a parsed JSON object.
pub fn mapping_from_json_object(object: serde_json::Map<String, JsonValue>) -> AttributeMapping {
    object
        .into_iter()
        .map(|(key, value)| (key, AttributeValue::from_json(value)))
        .collect()
}

/// A listing record ready to be appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub raw_text: String,
    pub timestamp: Option<NaiveDateTime>,
    pub author: String,
    pub attributes: AttributeMapping,
}

/// A listing record as held by the store. `raw_text` is the reconciliation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub raw_text: String,
    pub timestamp: Option<NaiveDateTime>,
    pub author: String,
    pub attributes: AttributeMapping,
}

impl PersistedRecord {
    pub fn from_new(id: i64, record: NewRecord) -> Self {
        Self {
            id,
            raw_text: record.raw_text,
            timestamp: record.timestamp,
            author: record.author,
            attributes: record.attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub description: String,
}

/// Ordered set of fields the extraction model is asked to populate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, description)| SchemaField {
                    name: name.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        )
    }

    /// Built-in apartment rental listing schema.
    pub fn rental_listing() -> Self {
        Self::from_pairs([
            ("BHK", "number of BHK (integer)"),
            ("Bedroom", "master or non-master bedroom or hall (string)"),
            ("Sharing", "a boolean True if a room is shared otherwise False (bool)"),
            ("Gender", "is flat available for male or female (Male/Female/Family)"),
            ("Address", "address of the flat, locality or society (string)"),
            ("Rent", "rent for the flat (integer)"),
            ("Deposit", "security deposit of the flat (integer)"),
            (
                "Restrictions",
                "are there restrictions when using flat. Use the following, 'no smoking' or 'no drinking' or 'no non-vegetarian' or 'no boys' or 'no restrictions'. Mention if it is something else in similar fashion (string)",
            ),
            ("Furnished", "Furnishing of the flat (Furnished/Semi-Furnished/Unfurnished)"),
            (
                "Brokerage",
                "the amount of brokerage needs to be given. If no brokerage is required set to 0 (integer)",
            ),
            (
                "AvailableDate",
                "date/time period from which the flat is availabe. If it is a date, write as day month year format(time)",
            ),
            ("ContactDetail", "phone number / or DM on telegram (string)"),
        ])
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::rental_listing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: Option<&str>, first: Option<&str>, last: Option<&str>) -> RawMessage {
        RawMessage {
            id: 7,
            timestamp: DateTime::parse_from_rfc3339("2025-03-01T10:00:00+05:30").unwrap(),
            text: text.map(str::to_string),
            sender_first_name: first.map(str::to_string),
            sender_last_name: last.map(str::to_string),
        }
    }

    #[test]
    fn normalizer_strips_nbsp_and_emoji() {
        let cleaned = normalize_text("  \u{1F3E0} 2BHK\u{a0}flat available \u{2705}\u{FE0F} \u{1F44D}\u{1F3FD}  ");
        assert_eq!(cleaned, "2BHK flat available");
    }

    #[test]
    fn normalizer_strips_subdivision_flag_tags() {
        let england = "\u{1F3F4}\u{E0067}\u{E0062}\u{E0065}\u{E006E}\u{E0067}\u{E007F}";
        assert_eq!(normalize_text(&format!("Flat {england} ok")), "Flat  ok");
        assert_eq!(
            normalize_text(&format!("2BHK near park {england}")),
            normalize_text("2BHK near park")
        );
    }

    #[test]
    fn normalizer_keeps_keycap_digits() {
        assert_eq!(normalize_text("1\u{FE0F}\u{20E3} BHK"), "1 BHK");
    }

    #[test]
    fn normalizer_keeps_plain_text_and_digits() {
        assert_eq!(normalize_text("Rent 25000, deposit #2"), "Rent 25000, deposit #2");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn sender_name_skips_missing_parts() {
        assert_eq!(CleanedMessage::from_raw(&raw(Some("x"), Some("Akash"), Some("Kumar"))).sender_name, "Akash Kumar");
        assert_eq!(CleanedMessage::from_raw(&raw(Some("x"), Some("Akash"), None)).sender_name, "Akash");
        assert_eq!(CleanedMessage::from_raw(&raw(Some("x"), Some(""), Some("Kumar"))).sender_name, "Kumar");
        assert_eq!(CleanedMessage::from_raw(&raw(Some("x"), None, None)).sender_name, "");
    }

    #[test]
    fn missing_text_becomes_empty_string() {
        assert_eq!(CleanedMessage::from_raw(&raw(None, None, None)).text, "");
    }

    #[test]
    fn naive_timestamp_keeps_wall_clock() {
        let msg = CleanedMessage::from_raw(&raw(Some("x"), None, None));
        assert_eq!(msg.naive_timestamp().to_string(), "2025-03-01 10:00:00");
    }

    #[test]
    fn attribute_values_convert_from_json() {
        let value: JsonValue = serde_json::json!({
            "BHK": 2,
            "Rent": 25000.5,
            "Sharing": false,
            "Gender": ["Male", "Female"],
            "Address": "Hinjewadi",
            "Deposit": null,
            "Extra": {"nested": true}
        });
        let JsonValue::Object(obj) = value else { unreachable!() };
        let mapping = mapping_from_json_object(obj);
        assert_eq!(mapping["BHK"], AttributeValue::Integer(2));
        assert_eq!(mapping["Rent"], AttributeValue::Float(25000.5));
        assert_eq!(mapping["Sharing"], AttributeValue::Boolean(false));
        assert_eq!(mapping["Gender"], AttributeValue::List(vec!["Male".into(), "Female".into()]));
        assert_eq!(mapping["Deposit"], AttributeValue::Empty);
        assert_eq!(mapping["Extra"], AttributeValue::Text(r#"{"nested":true}"#.into()));
    }

    #[test]
    fn attribute_mapping_serde_is_plain_json() {
        let mut mapping = AttributeMapping::new();
        mapping.insert("BHK".into(), AttributeValue::Integer(3));
        mapping.insert("Furnished".into(), AttributeValue::Text("FURNISHED".into()));
        mapping.insert("Deposit".into(), AttributeValue::Empty);
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json, serde_json::json!({"BHK": 3, "Deposit": null, "Furnished": "FURNISHED"}));
        let back: AttributeMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn rental_schema_is_ordered() {
        let schema = Schema::rental_listing();
        let names = schema.fields().iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names.first(), Some(&"BHK"));
        assert_eq!(names.last(), Some(&"ContactDetail"));
        assert_eq!(names.len(), 12);
        assert!(schema.contains("Rent"));
        assert!(!schema.contains("rent"));
    }
}
