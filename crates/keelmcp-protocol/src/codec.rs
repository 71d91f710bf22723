//! Message codec: byte buffers in, classified envelopes out.
//!
//! Classification is deliberately manual rather than an untagged serde enum,
//! so the ordering of the shape rules is explicit and testable:
//!
//! 1. Not valid JSON → parse error
//! 2. Array → batch, recursed element-wise; empty batches are rejected
//! 3. Missing or non-`"2.0"` `jsonrpc` → invalid request
//! 4. `method` without `id` → notification
//! 5. `method` with `id` → request
//! 6. `id` with exactly one of `result`/`error` → response
//! 7. Anything else → invalid request

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::jsonrpc::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RequestId,
    ResponsePayload,
};

/// One classified envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A request expecting a reply
    Request(JsonRpcRequest),
    /// A fire-and-forget notification
    Notification(JsonRpcNotification),
    /// A reply to an earlier request
    Response(JsonRpcResponse),
    /// A batch element whose shape was invalid; carries the error that
    /// should be answered for it
    Invalid(JsonRpcError),
}

/// Result of decoding one inbound buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A single envelope
    Single(Classified),
    /// A batch of envelopes, classified element-wise
    Batch(Vec<Classified>),
}

/// Decode an inbound byte buffer into classified envelopes.
///
/// # Errors
///
/// Returns [`ProtocolError::Parse`] when the buffer is not valid JSON,
/// and [`ProtocolError::InvalidRequest`] for an empty batch or a top-level
/// value that is neither an object nor an array. Shape errors inside a
/// non-empty batch are reported per element as [`Classified::Invalid`].
pub fn decode(bytes: &[u8]) -> ProtocolResult<Decoded> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ProtocolError::invalid_request("empty batch"));
            }
            let classified = items
                .into_iter()
                .map(|item| match classify_object(item) {
                    Ok(c) => c,
                    Err(e) => Classified::Invalid(e.to_json_rpc()),
                })
                .collect();
            Ok(Decoded::Batch(classified))
        }
        other => classify_object(other).map(Decoded::Single),
    }
}

/// Encode any serializable envelope to bytes.
///
/// Absent optional fields are skipped entirely, never emitted as `null`.
///
/// # Errors
///
/// Returns [`ProtocolError::Internal`] if serialization fails, which only
/// happens for payloads containing non-JSON-representable values.
pub fn encode<T: Serialize>(envelope: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| ProtocolError::internal(e.to_string()))
}

fn classify_object(value: Value) -> ProtocolResult<Classified> {
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::invalid_request(
            "envelope must be a JSON object",
        ));
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        _ => {
            return Err(ProtocolError::invalid_request(
                "missing or invalid jsonrpc version",
            ));
        }
    }

    let had_id_key = obj.contains_key("id");
    let id = take_id(&mut obj)?;
    let method = obj.remove("method");
    let params = obj.remove("params");

    if let Some(method) = method {
        let Value::String(method) = method else {
            return Err(ProtocolError::invalid_request("method must be a string"));
        };
        return Ok(match id {
            Some(id) => Classified::Request(JsonRpcRequest {
                jsonrpc: JsonRpcVersion,
                id,
                method,
                params,
            }),
            None => Classified::Notification(JsonRpcNotification {
                jsonrpc: JsonRpcVersion,
                method,
                params,
            }),
        });
    }

    // No method: must be a response, and responses must carry an id key
    // (a null id is legal for parse-error replies).
    if !had_id_key {
        return Err(ProtocolError::invalid_request(
            "envelope has neither method nor id",
        ));
    }

    let result = obj.remove("result");
    let error = obj.remove("error");
    let payload = match (result, error) {
        (Some(result), None) => ResponsePayload::Success { result },
        (None, Some(error)) => ResponsePayload::Error {
            error: serde_json::from_value(error)
                .map_err(|e| ProtocolError::invalid_request(format!("malformed error object: {e}")))?,
        },
        (Some(_), Some(_)) => {
            return Err(ProtocolError::invalid_request(
                "response carries both result and error",
            ));
        }
        (None, None) => {
            return Err(ProtocolError::invalid_request(
                "response carries neither result nor error",
            ));
        }
    };

    Ok(Classified::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion,
        id,
        payload,
    }))
}

fn take_id(obj: &mut Map<String, Value>) -> ProtocolResult<Option<RequestId>> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| ProtocolError::invalid_request("id must be an integer or string")),
        Some(_) => Err(ProtocolError::invalid_request(
            "id must be an integer or string",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode_str(s: &str) -> ProtocolResult<Decoded> {
        decode(s.as_bytes())
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = decode_str("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse(_)));
        assert_eq!(err.code().code(), -32700);
    }

    #[test]
    fn empty_batch_is_invalid() {
        let err = decode_str("[]").unwrap_err();
        assert_eq!(err.code().code(), -32600);
    }

    #[test]
    fn missing_version_is_invalid() {
        let err = decode_str(r#"{"id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code().code(), -32600);
        let err = decode_str(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code().code(), -32600);
    }

    #[test]
    fn method_without_id_is_a_notification() {
        let decoded =
            decode_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        let Decoded::Single(Classified::Notification(n)) = decoded else {
            panic!("expected notification, got {decoded:?}");
        };
        assert_eq!(n.method, "notifications/initialized");
    }

    #[test]
    fn method_with_id_is_a_request() {
        let decoded =
            decode_str(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list","params":{}}"#).unwrap();
        let Decoded::Single(Classified::Request(r)) = decoded else {
            panic!("expected request, got {decoded:?}");
        };
        assert_eq!(r.id, RequestId::Number(3));
        assert_eq!(r.method, "tools/list");
    }

    #[test]
    fn id_with_result_is_a_response() {
        let decoded = decode_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        let Decoded::Single(Classified::Response(r)) = decoded else {
            panic!("expected response, got {decoded:?}");
        };
        assert_eq!(r.result(), Some(&json!({"ok": true})));
    }

    #[test]
    fn both_result_and_error_is_invalid() {
        let err = decode_str(
            r#"{"jsonrpc":"2.0","id":3,"result":1,"error":{"code":-32000,"message":"x"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code().code(), -32600);
    }

    #[test]
    fn neither_result_nor_error_is_invalid() {
        let err = decode_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap_err();
        assert_eq!(err.code().code(), -32600);
    }

    #[test]
    fn result_without_id_key_is_invalid() {
        let err = decode_str(r#"{"jsonrpc":"2.0","result":1}"#).unwrap_err();
        assert_eq!(err.code().code(), -32600);
    }

    #[test]
    fn batch_classifies_element_wise() {
        let decoded = decode_str(
            r#"[
                {"jsonrpc":"2.0","id":1,"method":"ping"},
                {"jsonrpc":"2.0","method":"notifications/progress"},
                {"bad":"shape"}
            ]"#,
        )
        .unwrap();
        let Decoded::Batch(items) = decoded else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Classified::Request(_)));
        assert!(matches!(items[1], Classified::Notification(_)));
        let Classified::Invalid(ref err) = items[2] else {
            panic!("expected invalid element");
        };
        assert_eq!(err.code, -32600);
    }

    #[test]
    fn round_trip_preserves_envelopes() {
        let request = JsonRpcRequest::new(9, "tools/call", Some(json!({"name": "t"})));
        let bytes = encode(&request).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, Decoded::Single(Classified::Request(request)));

        let response = JsonRpcResponse::success(RequestId::Number(9), json!([1, 2, 3]));
        let bytes = encode(&response).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, Decoded::Single(Classified::Response(response)));

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        let bytes = encode(&notification).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            Decoded::Single(Classified::Notification(notification))
        );
    }

    #[test]
    fn null_id_decodes_as_parse_error_reply() {
        let decoded = decode_str(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        let Decoded::Single(Classified::Response(r)) = decoded else {
            panic!("expected response");
        };
        assert!(r.id.is_none());
    }
}
