//! Canonical-conversion scenario: a caller pastes in a SLIP-132 xpub variant (ypub/zpub) and
//! expects it normalized to the plain `xpub` form without losing any of the underlying BIP-32
//! node data. Vectors below are genuine checksummed SLIP-132 triples, not hand-assembled bytes.

use hwal::xpub::{canonicalize, to_xpub};

const XPUB: &str = "xpub661MyMwAqRbcFLqTBCNzuoj4FYE1xRxmCjrSWC6LUjKHo46Du4NacKgxdrJPWhzLjkPsXqnjAUwn1raMSWfxWZKysPoBNQMZMs8b5JM8egC";
const YPUB: &str = "ypub6QqdH2c5z7966e2a1ZAd7tpZRWNTu3xG7rNfHazDrjhAr9uT9iY9EPM6f4FyWceG9PWgHKPHd9JKu9BvAD5yJo1ajjVbxKB3dbCETvZ3Jzw";
const ZPUB: &str = "zpub6jftahH18ngZwwDgquxFKyv4bUWuqfwm2xtt4yt7Ek53uFigQNhhrT1EgGDZWXJBZ2dV2nyr5oesnRoUsuVz72hBc5C2YDzXuKFsrTu7JHp";

#[test]
fn ypub_canonicalizes_to_the_same_xpub() {
    assert_eq!(canonicalize(YPUB).unwrap(), XPUB);
}

#[test]
fn zpub_canonicalizes_to_the_same_xpub() {
    assert_eq!(canonicalize(ZPUB).unwrap(), XPUB);
}

#[test]
fn all_three_prefixes_decode_to_the_identical_node() {
    let from_xpub = to_xpub(XPUB).unwrap();
    let from_ypub = to_xpub(YPUB).unwrap();
    let from_zpub = to_xpub(ZPUB).unwrap();

    for other in [from_ypub, from_zpub] {
        assert_eq!(from_xpub.depth, other.depth);
        assert_eq!(from_xpub.parent_fingerprint, other.parent_fingerprint);
        assert_eq!(from_xpub.child_number, other.child_number);
        assert_eq!(from_xpub.chain_code, other.chain_code);
        assert_eq!(from_xpub.public_key, other.public_key);
    }
}
