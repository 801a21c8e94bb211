use crate::app_error::{AppError, AppResult, ErrorCode};
use serde_json::Value;

fn write_canonical(value: &Value, out: &mut String) -> AppResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if n.is_f64() {
                return Err(AppError::new(
                    ErrorCode::CanonJsonFailed,
                    "floats are forbidden in canonical json",
                    serde_json::json!({ "value": n.to_string() }),
                ));
            }
            out.push_str(&n.to_string());
        }
        Value::String(s) => out.push_str(&encode_str(s)?),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&encode_str(key)?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_str(s: &str) -> AppResult<String> {
    serde_json::to_string(s).map_err(|e| {
        AppError::new(
            ErrorCode::CanonJsonFailed,
            "failed to encode string",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

/// Sorted-key, whitespace-free JSON encoding used for manifests so that the
/// same content always hashes the same.
pub fn to_canonical_bytes(value: &Value) -> AppResult<Vec<u8>> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out.into_bytes())
}
