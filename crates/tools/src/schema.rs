//! Argument filtering against a tool's declared parameter schema.
//!
//! Models routinely invent extra arguments. Local handlers only ever see
//! the keys their schema declares; everything else is dropped and reported
//! back to the caller for logging.

use serde_json::{Map, Value};

/// Arguments split into what the handler receives and what was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredArguments {
    pub kept: Map<String, Value>,
    /// Names of dropped keys. A non-object payload shows up as `<non-object>`.
    pub dropped: Vec<String>,
}

/// Keep only the arguments declared in `schema.properties`.
///
/// - Arguments given as a JSON-encoded string are decoded first.
/// - A schema without `properties`, or with `additionalProperties: true`,
///   accepts every key.
/// - `null` arguments mean "no arguments".
pub fn filter_arguments(schema: &Value, arguments: &Value) -> FilteredArguments {
    let decoded;
    let arguments = match arguments {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                decoded = value;
                &decoded
            }
            Err(_) => return non_object(),
        },
        other => other,
    };

    let provided = match arguments {
        Value::Object(map) => map,
        Value::Null => return FilteredArguments::default(),
        _ => return non_object(),
    };

    let declared = schema.get("properties").and_then(Value::as_object);
    let open = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(declared) = declared.filter(|_| !open) else {
        return FilteredArguments {
            kept: provided.clone(),
            dropped: Vec::new(),
        };
    };

    let mut out = FilteredArguments::default();
    for (key, value) in provided {
        if declared.contains_key(key) {
            out.kept.insert(key.clone(), value.clone());
        } else {
            out.dropped.push(key.clone());
        }
    }
    out
}

fn non_object() -> FilteredArguments {
    FilteredArguments {
        kept: Map::new(),
        dropped: vec!["<non-object>".into()],
    }
}
