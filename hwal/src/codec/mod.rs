//! Wire codec (`spec.md` §4.2, C2): vendor-specific framing and encoding on top of the raw
//! byte-stream `Transport`s. Each adapter picks the codec matching its vendor; `hwal::adapters`
//! never builds wire bytes by hand.

pub mod apdu;
pub mod bridge_rpc;
pub mod cbor;
