//! Field-level vocabulary normalization for extracted rental attributes.
//!
//! Every function here is pure; unknown inputs pass through with light cleanup.

use std::sync::LazyLock;

use regex::Regex;

use crate::{AttributeMapping, AttributeValue};

static APR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bapr\b").expect("apr pattern"));
static ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)(th|st|rd|nd)").expect("ordinal pattern"));
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b20\d{2}\b").expect("year pattern"));

/// Fields stored as zero when blank or missing.
pub const ZERO_DEFAULT_FIELDS: [&str; 3] = ["Rent", "Deposit", "Brokerage"];

pub fn map_bedroom(text: &str) -> String {
    match text.trim().to_lowercase().as_str() {
        "non-master bedroom" => "Non-master Bedroom".to_string(),
        "master" | "master bedroom" => "Master Bedroom".to_string(),
        "hall" => "Hall".to_string(),
        "single" | "single room" => "Single".to_string(),
        "double" => "Double".to_string(),
        _ => text.to_string(),
    }
}

/// "male/female" becomes `["Male", "Female"]`.
pub fn split_gender(text: &str) -> Vec<String> {
    title_case(text)
        .split('/')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

pub fn map_restrictions<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    let mut out = items
        .iter()
        .map(|item| item.as_ref().trim())
        .filter(|item| !item.is_empty())
        .map(|item| {
            let mapped = match item.to_lowercase().as_str() {
                "no smoking" | "non smoker" => "NO_SMOKING",
                "no drinking" | "no alcohol" | "non drinker" => "NO_DRINKING",
                "no restrictions" | "no restriction" | "no_restrictions" => "NONE",
                "no boys" | "no boys allowed" => "NO_BOYS",
                "only vegetarians" | "no non-vegetarian food" | "no non-vegetarian" | "pure veg" => {
                    "NO_NONVEG"
                }
                _ => item,
            };
            mapped.to_string()
        })
        .collect::<Vec<_>>();
    if out.iter().any(|r| r == "NONE") {
        return vec!["NONE".to_string()];
    }
    out.sort();
    out
}

pub fn map_furnished(text: &str) -> String {
    let squashed = text.replace(['-', ' '], "");
    match squashed.to_lowercase().as_str() {
        "semifurnished" => "SEMI_FURNISHED".to_string(),
        "fullyfurnished" | "furnished" | "fullfurnished" => "FURNISHED".to_string(),
        "unfurnished" => "UNFURNISHED".to_string(),
        _ => squashed,
    }
}

/// Canonicalizes availability phrases: "1st Apr, 2025" and "April 1" both become "1 April".
pub fn normalize_available_date(text: &str) -> String {
    let lower = text.to_lowercase();
    let lower = APR.replace_all(&lower, "april");
    let lower = ORDINAL.replace_all(&lower, "$1");
    let lower = YEAR.replace_all(&lower, "");
    let cleaned = lower.replace(',', "").replace("after", "");
    let titled = title_case(cleaned.split_whitespace().collect::<Vec<_>>().join(" ").trim());

    if titled.contains("Now") || titled.contains("Immediate") {
        return "Immediate".to_string();
    }

    let mut words = titled.split(' ').collect::<Vec<_>>();
    if words.len() == 2 {
        words.sort_unstable();
        return words.join(" ");
    }
    titled
}

pub fn normalize_address(text: &str) -> String {
    title_case(text).replace("  ", " ")
}

pub fn normalize_contact(text: &str) -> String {
    if text.to_lowercase().contains("ping") {
        "DM".to_string()
    } else {
        text.to_string()
    }
}

/// Apply the field vocabularies to one extracted mapping.
pub fn normalize_attributes(attributes: &AttributeMapping) -> AttributeMapping {
    let mut out = attributes.clone();
    for (key, value) in out.iter_mut() {
        let normalized = match (key.as_str(), &*value) {
            ("Bedroom", AttributeValue::Text(s)) => AttributeValue::Text(map_bedroom(s)),
            ("Gender", AttributeValue::Text(s)) => AttributeValue::List(split_gender(s)),
            ("Address", AttributeValue::Text(s)) => AttributeValue::Text(normalize_address(s)),
            ("Restrictions", AttributeValue::Text(s)) => {
                AttributeValue::List(map_restrictions(&s.split(',').collect::<Vec<_>>()))
            }
            ("Restrictions", AttributeValue::List(items)) => {
                AttributeValue::List(map_restrictions(items))
            }
            ("Furnished", AttributeValue::Text(s)) => AttributeValue::Text(map_furnished(s)),
            ("AvailableDate", AttributeValue::Text(s)) => {
                AttributeValue::Text(normalize_available_date(s))
            }
            ("ContactDetail", AttributeValue::Text(s)) => {
                AttributeValue::Text(normalize_contact(s))
            }
            (field, v) if ZERO_DEFAULT_FIELDS.contains(&field) => amount_value(v),
            (_, v) => v.clone(),
        };
        *value = normalized;
    }
    for field in ZERO_DEFAULT_FIELDS {
        out.entry(field.to_string()).or_insert(AttributeValue::Integer(0));
    }
    out
}

fn amount_value(value: &AttributeValue) -> AttributeValue {
    match value {
        v if v.is_blank() => AttributeValue::Integer(0),
        AttributeValue::Text(s) => {
            let digits = s.replace([',', ' '], "");
            digits
                .parse::<i64>()
                .map(AttributeValue::Integer)
                .unwrap_or_else(|_| value.clone())
        }
        AttributeValue::Float(f) if f.is_finite() => AttributeValue::Integer(f.trunc() as i64),
        AttributeValue::Boolean(false) => AttributeValue::Integer(0),
        other => other.clone(),
    }
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}
