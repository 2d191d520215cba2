//! Bridge-daemon JSON-RPC codec (`spec.md` §4.2, §4.6): Trezor call bodies.
//!
//! Builds the `{"method", "params"}` envelope the `hwal::transport::bridge` transport expects,
//! and decodes typed results back out of the daemon's JSON reply.

use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use crate::error::Error;

pub fn build_call(method: &str, params: Json) -> Result<Vec<u8>, Error> {
    let call = serde_json::json!({ "method": method, "params": params });
    serde_json::to_vec(&call).map_err(|e| Error::Protocol(e.to_string()))
}

pub fn parse_result<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("decoding bridge reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_method_and_params() {
        let bytes = build_call("get_address", serde_json::json!({"path": "m/84'/0'/0'"})).unwrap();
        let value: Json = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["method"], "get_address");
        assert_eq!(value["params"]["path"], "m/84'/0'/0'");
    }
}
