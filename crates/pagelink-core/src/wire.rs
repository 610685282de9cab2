//! Frames exchanged over a peer connection. One JSON object per frame:
//!
//! - invocation: `{"call": <id>, "name": <string>, "args": [...]}`
//! - resolution: `{"return": <id>, "status": "ok"|"error", "value": ..., "error": {...}}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DispatchError;
use crate::ids::CallId;

/// Outcome of a remote call as seen by the caller.
pub type CallResult = Result<Value, PeerError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// Structured error carried by a `status=error` resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerError {
    #[serde(rename = "errorText", default)]
    pub error_text: String,
    #[serde(rename = "errorTraceback", default)]
    pub error_traceback: String,
}

impl PeerError {
    /// Peers report errors either as `{errorText, errorTraceback}` or as a bare
    /// string with the trace in a sibling `stack` field.
    fn from_frame(error: Option<&Value>, stack: Option<&Value>) -> Self {
        let stack = stack.and_then(Value::as_str).unwrap_or_default().to_string();
        match error {
            Some(Value::Object(obj)) => Self {
                error_text: obj
                    .get("errorText")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error_traceback: obj
                    .get("errorTraceback")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(stack),
            },
            Some(Value::String(text)) => Self {
                error_text: text.clone(),
                error_traceback: stack,
            },
            Some(other) if !other.is_null() => Self {
                error_text: other.to_string(),
                error_traceback: stack,
            },
            _ => Self {
                error_text: String::new(),
                error_traceback: stack,
            },
        }
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error_text)
    }
}

impl std::error::Error for PeerError {}

/// Outbound invocation of a peer function. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "call")]
    pub id: CallId,
    pub name: String,
    pub args: Vec<Value>,
}

/// Inbound invocation of a local function. The id is echoed back verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub id: Value,
    pub name: String,
    pub args: Vec<Value>,
}

/// Response correlated to an invocation by id.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Resolution {
    #[serde(rename = "return")]
    pub id: Value,
    pub status: Status,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PeerError>,
}

impl Resolution {
    pub fn ok(id: Value, value: Value) -> Self {
        Self {
            id,
            status: Status::Ok,
            value,
            error: None,
        }
    }

    pub fn error(id: Value, error: PeerError) -> Self {
        Self {
            id,
            status: Status::Error,
            value: Value::Null,
            error: Some(error),
        }
    }

    /// Id of the outbound call this resolves, if it is numeric.
    pub fn call_id(&self) -> Option<CallId> {
        self.id.as_f64().map(CallId::from_raw)
    }

    pub fn into_result(self) -> CallResult {
        match self.status {
            Status::Ok => Ok(self.value),
            Status::Error => Err(self.error.unwrap_or_default()),
        }
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Invoke(Invocation),
    Resolve(Resolution),
}

impl Frame {
    /// Decode one frame. Invalid JSON is a [`DispatchError::Decode`]; valid JSON
    /// of an unrecognized shape is a [`DispatchError::Malformed`].
    pub fn decode(text: &str) -> Result<Self, DispatchError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(obj) = value else {
            return Err(DispatchError::Malformed("frame is not a JSON object".into()));
        };

        if let Some(id) = obj.get("call") {
            return decode_invocation(id.clone(), &obj).map(Frame::Invoke);
        }
        if let Some(id) = obj.get("return") {
            return decode_resolution(id.clone(), &obj).map(Frame::Resolve);
        }
        Err(DispatchError::Malformed(
            "frame has neither \"call\" nor \"return\"".into(),
        ))
    }
}

fn decode_invocation(id: Value, obj: &Map<String, Value>) -> Result<Invocation, DispatchError> {
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::Malformed("invocation without a \"name\"".into()))?
        .to_string();
    let args = match obj.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DispatchError::Malformed(
                "invocation \"args\" is not an array".into(),
            ))
        }
    };
    Ok(Invocation { id, name, args })
}

fn decode_resolution(id: Value, obj: &Map<String, Value>) -> Result<Resolution, DispatchError> {
    match obj.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(Resolution::ok(
            id,
            obj.get("value").cloned().unwrap_or(Value::Null),
        )),
        Some("error") => Ok(Resolution::error(
            id,
            PeerError::from_frame(obj.get("error"), obj.get("stack")),
        )),
        Some(other) => Err(DispatchError::Malformed(format!(
            "unknown resolution status \"{other}\""
        ))),
        None => Err(DispatchError::Malformed("resolution without a \"status\"".into())),
    }
}

/// Convert to a JSON value, replacing anything unrepresentable with `null`.
pub fn safe_value<T: Serialize + ?Sized>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Value not representable on the wire, sending null");
            Value::Null
        }
    }
}

/// Serialize a frame, replacing anything unrepresentable with `null`.
pub fn safe_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Frame not representable on the wire, sending null");
        "null".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn call_serializes_with_wire_field_names() {
        let call = Call {
            id: CallId::from_raw(3.25),
            name: "js_random".into(),
            args: vec![json!(1), json!("two")],
        };
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v, json!({"call": 3.25, "name": "js_random", "args": [1, "two"]}));
    }

    fn echo_call_id(call: &Call) -> Option<CallId> {
        let sent: Value = serde_json::from_str(&safe_json(call)).unwrap();
        let reply = json!({"return": sent["call"], "status": "ok", "value": null}).to_string();
        match Frame::decode(&reply).unwrap() {
            Frame::Resolve(res) => res.call_id(),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn call_ids_survive_the_wire_exactly() {
        // Values whose shortest decimal form used to parse back one ULP off.
        for raw in [12.950156184647927, 1.444007939304624] {
            let call = Call {
                id: CallId::from_raw(raw),
                name: "f".into(),
                args: vec![],
            };
            assert_eq!(echo_call_id(&call), Some(call.id), "id {raw} changed on the wire");
        }

        let ids = crate::ids::CallIdGenerator::new();
        for _ in 0..20_000 {
            let call = Call {
                id: ids.next_id(),
                name: "f".into(),
                args: vec![],
            };
            assert_eq!(echo_call_id(&call), Some(call.id), "id {} changed on the wire", call.id);
        }
    }

    #[test]
    fn decode_invocation_frame() {
        let frame = Frame::decode(r#"{"call": 7.5, "name": "double", "args": [21]}"#).unwrap();
        let Frame::Invoke(inv) = frame else {
            panic!("expected invoke");
        };
        assert_eq!(inv.id, json!(7.5));
        assert_eq!(inv.name, "double");
        assert_eq!(inv.args, vec![json!(21)]);
    }

    #[test]
    fn decode_invocation_without_args() {
        let frame = Frame::decode(r#"{"call": 1, "name": "ping"}"#).unwrap();
        assert!(matches!(frame, Frame::Invoke(inv) if inv.args.is_empty()));
    }

    #[test]
    fn decode_ok_resolution() {
        let frame = Frame::decode(r#"{"return": 2.5, "status": "ok", "value": 42, "error": {}}"#)
            .unwrap();
        let Frame::Resolve(res) = frame else {
            panic!("expected resolve");
        };
        assert_eq!(res.call_id(), Some(CallId::from_raw(2.5)));
        assert_eq!(res.into_result(), Ok(json!(42)));
    }

    #[test]
    fn decode_error_resolution_structured() {
        let frame = Frame::decode(
            r#"{"return": 1, "status": "error", "error": {"errorText": "boom", "errorTraceback": "at f"}}"#,
        )
        .unwrap();
        let Frame::Resolve(res) = frame else {
            panic!("expected resolve");
        };
        let err = res.into_result().unwrap_err();
        assert_eq!(err.error_text, "boom");
        assert_eq!(err.error_traceback, "at f");
    }

    #[test]
    fn decode_error_resolution_string_with_stack() {
        let frame = Frame::decode(
            r#"{"return": 1, "status": "error", "error": "TypeError: x", "stack": "at js_with_error"}"#,
        )
        .unwrap();
        let Frame::Resolve(res) = frame else {
            panic!("expected resolve");
        };
        let err = res.into_result().unwrap_err();
        assert_eq!(err.error_text, "TypeError: x");
        assert_eq!(err.error_traceback, "at js_with_error");
    }

    #[test]
    fn missing_value_is_null() {
        let frame = Frame::decode(r#"{"return": 1, "status": "ok"}"#).unwrap();
        let Frame::Resolve(res) = frame else {
            panic!("expected resolve");
        };
        assert_eq!(res.value, Value::Null);
    }

    #[test]
    fn invalid_json_is_decode_error() {
        let err = Frame::decode("{not json").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unrecognized_shape_is_malformed() {
        let err = Frame::decode(r#"{"hello": "world"}"#).unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
        assert!(!err.is_fatal());

        let err = Frame::decode("[1, 2]").unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));

        let err = Frame::decode(r#"{"return": 1, "status": "maybe"}"#).unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
    }

    #[test]
    fn resolution_serializes_error_only_when_failed() {
        let ok = serde_json::to_value(Resolution::ok(json!(1.5), json!("hi"))).unwrap();
        assert_eq!(ok, json!({"return": 1.5, "status": "ok", "value": "hi"}));

        let err = Resolution::error(
            json!(2),
            PeerError {
                error_text: "bad".into(),
                error_traceback: "trace".into(),
            },
        );
        let v = serde_json::to_value(err).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["errorText"], "bad");
        assert_eq!(v["error"]["errorTraceback"], "trace");
        assert!(v["value"].is_null());
    }

    #[test]
    fn safe_value_replaces_unrepresentable_with_null() {
        // Non-string map keys cannot become a JSON object.
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        assert_eq!(safe_value(&map), Value::Null);
        assert_eq!(safe_value(&vec![1, 2]), json!([1, 2]));
    }

    #[test]
    fn safe_json_never_fails() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        assert_eq!(safe_json(&map), "null");
    }
}
