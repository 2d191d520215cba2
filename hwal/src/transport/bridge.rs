//! Bridge-daemon transport (`spec.md` §4.1): Trezor, reached over its local Trezor Bridge HTTP
//! daemon via JSON-RPC, the same `jsonrpc` + `minreq_http` stack `lianad` uses for bitcoind.

use async_trait::async_trait;
use jsonrpc::client::Client;
use jsonrpc::minreq_http::MinreqHttpTransport;
use serde_json::value::RawValue;
use std::time::Duration;

use crate::error::Error;
use crate::transport::Transport;

pub struct BridgeTransport {
    client: Client,
}

impl BridgeTransport {
    /// `url` is the bridge daemon's base URL, typically `http://127.0.0.1:21325`. `timeout` is
    /// the HTTP socket deadline (`spec.md` §4.2's per-roundtrip deadline).
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, Error> {
        let transport = MinreqHttpTransport::builder()
            .url(url)
            .map_err(|e| Error::BridgeUnavailable(e.to_string()))?
            .timeout(timeout)
            .build();
        Ok(BridgeTransport {
            client: Client::with_transport(transport),
        })
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    /// `request` is a pre-serialized `{"method": ..., "params": ...}` JSON-RPC call body; the
    /// C2 bridge codec is responsible for building and parsing these, this layer only performs
    /// the HTTP roundtrip to the daemon.
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        let call: BridgeCall = serde_json::from_slice(request)
            .map_err(|e| Error::Protocol(format!("malformed bridge request: {}", e)))?;
        let params = RawValue::from_string(call.params.to_string())
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let req = self.client.build_request(&call.method, Some(&params));
        // `minreq_http`'s transport is blocking; block the current worker thread for the HTTP
        // roundtrip rather than pull the client apart to make it `spawn_blocking`-movable.
        let resp = self
            .client
            .send_request(req)
            .map_err(|e| Error::BridgeUnavailable(e.to_string()))?;
        let result = resp
            .result::<serde_json::Value>()
            .map_err(|e| Error::BridgeUnavailable(e.to_string()))?;
        serde_json::to_vec(&result).map_err(|e| Error::Protocol(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct BridgeCall {
    method: String,
    params: serde_json::Value,
}
