//! Positional argument extraction for exposed functions.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Extract a required positional argument.
pub fn require_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("missing required argument at position {index}"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("invalid argument at position {index}: {e}"))
}

/// Extract an optional positional argument. Absent or `null` yields `None`.
pub fn optional_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<Option<T>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid argument at position {index}: {e}")),
    }
}
