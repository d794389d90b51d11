// Placeholder substitution for outbound message bodies

use autoflow_shared::Contact;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid")
});

const PAYLOAD_PREFIX: &str = "payload.";

/// Replace `{{key}}` placeholders with contact fields, custom fields or
/// `payload.<path>` values. Anything that cannot be resolved stays as written.
pub fn render(body: &str, contact: &Contact, payload: &Value) -> String {
    PLACEHOLDER
        .replace_all(body, |caps: &Captures| {
            resolve(&caps[1], contact, payload).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn resolve(key: &str, contact: &Contact, payload: &Value) -> Option<String> {
    if let Some(path) = key.strip_prefix(PAYLOAD_PREFIX) {
        return get_nested_value(payload, path).and_then(value_to_text);
    }

    match key {
        "name" => non_empty(contact.name.as_deref()),
        "phone" => non_empty(Some(contact.phone.as_str())),
        "email" => non_empty(contact.email.as_deref()),
        other => contact.custom_fields.get(other).cloned(),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn get_nested_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = json;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    Some(current)
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
