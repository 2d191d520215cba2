//! CBOR codec (`spec.md` §4.2, §4.6): Blockstream Jade's request/response envelope.
//!
//! Every call is a CBOR map `{"id": <str>, "method": <str>, "params": <map>}`; every reply is
//! `{"id": <str>, "result": <any>}` or `{"id": <str>, "error": {"code": <int>, "message": <str>}}`.

use ciborium::Value;

use crate::error::Error;

pub fn build_request(id: &str, method: &str, params: Value) -> Result<Vec<u8>, Error> {
    let map = Value::Map(vec![
        (Value::Text("id".to_string()), Value::Text(id.to_string())),
        (Value::Text("method".to_string()), Value::Text(method.to_string())),
        (Value::Text("params".to_string()), params),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&map, &mut out)
        .map_err(|e| Error::Protocol(format!("encoding Jade request: {}", e)))?;
    Ok(out)
}

fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find(|(k, _)| k.as_text() == Some(key)).map(|(_, v)| v)
}

/// Decode a Jade reply, checking its `id` matches the outgoing request's (`spec.md` §4.6: Jade
/// accumulates response bytes until a message whose `id` matches the request decodes), surfacing
/// `error` objects as `Error::Internal` carrying the vendor's numeric code, and returning the
/// `result` value otherwise.
pub fn parse_response(expected_id: &str, bytes: &[u8]) -> Result<Value, Error> {
    let value: Value = ciborium::de::from_reader(bytes)
        .map_err(|e| Error::Protocol(format!("decoding Jade response: {}", e)))?;
    let Value::Map(map) = &value else {
        return Err(Error::Protocol("Jade response is not a CBOR map".to_string()));
    };
    let reply_id = map_get(map, "id").and_then(Value::as_text);
    if reply_id != Some(expected_id) {
        return Err(Error::Protocol(format!(
            "Jade reply id {:?} does not match request id {:?}",
            reply_id, expected_id
        )));
    }
    if let Some(Value::Map(err)) = map_get(map, "error") {
        let code = map_get(err, "code").and_then(Value::as_integer).map(|i| i as i128 as u32);
        let message = map_get(err, "message")
            .and_then(Value::as_text)
            .unwrap_or("unknown Jade error")
            .to_string();
        return Err(Error::Internal(message, code));
    }
    map_get(map, "result")
        .cloned()
        .ok_or_else(|| Error::Protocol("Jade response has neither result nor error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_request_and_success_response() {
        let req = build_request("1", "get_xpub", Value::Map(vec![])).unwrap();
        assert!(!req.is_empty());

        let resp_map = Value::Map(vec![
            (Value::Text("id".to_string()), Value::Text("1".to_string())),
            (Value::Text("result".to_string()), Value::Text("xpub...".to_string())),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&resp_map, &mut bytes).unwrap();
        let result = parse_response("1", &bytes).unwrap();
        assert_eq!(result.as_text(), Some("xpub..."));
    }

    #[test]
    fn mismatched_reply_id_is_a_protocol_error() {
        let resp_map = Value::Map(vec![
            (Value::Text("id".to_string()), Value::Text("2".to_string())),
            (Value::Text("result".to_string()), Value::Text("xpub...".to_string())),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&resp_map, &mut bytes).unwrap();
        assert!(matches!(parse_response("1", &bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn surfaces_error_objects() {
        let err_map = Value::Map(vec![
            (Value::Text("id".to_string()), Value::Text("1".to_string())),
            (
                Value::Text("error".to_string()),
                Value::Map(vec![
                    (Value::Text("code".to_string()), Value::Integer(500.into())),
                    (
                        Value::Text("message".to_string()),
                        Value::Text("user declined".to_string()),
                    ),
                ]),
            ),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&err_map, &mut bytes).unwrap();
        let err = parse_response("1", &bytes).unwrap_err();
        assert!(matches!(err, Error::Internal(_, Some(500))));
    }
}
