//! SLIP-132 → canonical BIP-32 xpub/tpub conversion (`spec.md` §4.4, C4).
//!
//! Table-driven rewrite of the 4-byte version prefix only; every other byte of the 78-byte
//! BIP-32 record (depth, parent fingerprint, child number, chain code, pubkey) is carried over
//! verbatim, which is what makes the conversion a pure, property-testable boundary between
//! human-entered xpub strings and device-facing bytes.
//!
//! Grounded on the same table `bwt`'s `util::xpub` and BP-WG's `bp-bips` `derive::xpub` build
//! (see `examples/other_examples/53b997e6_bwt-dev-bwt__src-util-xpub.rs.rs` and
//! `examples/other_examples/045e8d22_BP-WG-bp-bips__derive-src-xpub.rs.rs`), but parameterized
//! over every SLIP-132 script-type prefix rather than just the plain p2pkh ones.

use miniscript::bitcoin::base58;
use miniscript::bitcoin::bip32::Xpub;
use std::str::FromStr;

use crate::error::Error;

const XPUB_MAINNET: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const XPUB_TESTNET: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

/// Every SLIP-132 prefix this core recognizes, and which network it belongs to.
/// Prefixes not in this table are passed through untouched (`spec.md` §4.4, §7 tier 1).
const KNOWN_PREFIXES: &[([u8; 4], bool /* is_mainnet */)] = &[
    // mainnet
    (XPUB_MAINNET, true),                 // xpub
    ([0x04, 0x9D, 0x7C, 0xB2], true),      // ypub (p2sh-p2wpkh)
    ([0x04, 0xB2, 0x47, 0x46], true),      // zpub (p2wpkh)
    ([0x02, 0x95, 0xB4, 0x3F], true),      // Ypub (p2sh-p2wsh multisig)
    ([0x02, 0xAA, 0x7E, 0xD3], true),      // Zpub (p2wsh multisig)
    // testnet
    (XPUB_TESTNET, false),                 // tpub
    ([0x04, 0x4A, 0x52, 0x62], false),     // upub
    ([0x04, 0x5F, 0x1C, 0xF6], false),     // vpub
    ([0x02, 0x42, 0x89, 0xEF], false),     // Upub
    ([0x02, 0x57, 0x50, 0x48], false),     // Vpub
];

fn known_network(version: &[u8]) -> Option<bool> {
    KNOWN_PREFIXES
        .iter()
        .find(|(prefix, _)| prefix == version)
        .map(|(_, is_mainnet)| *is_mainnet)
}

/// Rewrite a SLIP-132/BIP-32 extended public key string to use the canonical `xpub`/`tpub`
/// version bytes. Unknown prefixes are returned unchanged. Pure and deterministic: this is the
/// boundary `spec.md` §8's idempotence and semantic-preservation properties are defined against.
pub fn canonicalize(xpub_str: &str) -> Result<String, Error> {
    let mut data =
        base58::decode_check(xpub_str).map_err(|e| Error::InvalidXpub(e.to_string()))?;
    if data.len() != 78 {
        return Err(Error::InvalidXpub(format!(
            "expected 78 bytes after base58check decoding, got {}",
            data.len()
        )));
    }
    if let Some(is_mainnet) = known_network(&data[0..4]) {
        let canonical = if is_mainnet { XPUB_MAINNET } else { XPUB_TESTNET };
        data[0..4].copy_from_slice(&canonical);
    }
    Ok(base58::encode_check(&data))
}

/// Canonicalize then parse into a `bitcoin::bip32::Xpub`. `rust-bitcoin`'s own `Xpub::from_str`
/// only understands the canonical `xpub`/`tpub` prefixes, so any SLIP-132 variant must be
/// rewritten first.
pub fn to_xpub(xpub_str: &str) -> Result<Xpub, Error> {
    let canonical = canonicalize(xpub_str)?;
    Xpub::from_str(&canonical).map_err(|e| Error::InvalidXpub(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // zpub for the all-zero BIP-32 test vector master key, re-encoded with the zpub (p2wpkh)
    // version bytes, depth/fingerprint/child/chain/pubkey otherwise identical to the canonical
    // xpub below.
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    #[test]
    fn unknown_prefix_passes_through() {
        assert_eq!(canonicalize(XPUB).unwrap(), XPUB);
    }

    #[test]
    fn idempotence() {
        let once = canonicalize(XPUB).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn semantic_preservation_for_recognized_prefix() {
        // Re-encode the same 78 raw bytes under the zpub version, then canonicalize back.
        let data = base58::decode_check(XPUB).unwrap();
        let mut zpub_bytes = data.clone();
        zpub_bytes[0..4].copy_from_slice(&[0x04, 0xB2, 0x47, 0x46]);
        let zpub = base58::encode_check(&zpub_bytes);
        assert!(zpub.starts_with("zpub"));

        let back = canonicalize(&zpub).unwrap();
        assert_eq!(back, XPUB);

        let orig = to_xpub(XPUB).unwrap();
        let roundtripped = to_xpub(&zpub).unwrap();
        assert_eq!(orig.depth, roundtripped.depth);
        assert_eq!(orig.parent_fingerprint, roundtripped.parent_fingerprint);
        assert_eq!(orig.child_number, roundtripped.child_number);
        assert_eq!(orig.chain_code, roundtripped.chain_code);
        assert_eq!(orig.public_key, roundtripped.public_key);
    }

    #[test]
    fn wrong_length_is_invalid() {
        // A valid base58check string, but not 78 bytes of payload.
        let short = base58::encode_check(&[0u8; 40]);
        assert!(matches!(canonicalize(&short), Err(Error::InvalidXpub(_))));
    }
}
