//! Integration tests for `hwal::Registry`'s adapter-routing invariants, using
//! `hwal::testutils::MockAdapter` in place of physical hardware.

use hwal::error::Error;
use hwal::registry::Registry;
use hwal::testutils::{empty_psbt, MockAdapter};
use hwal::{Bip32Path, DeviceKind, SignRequest, SignResponse};
use miniscript::bitcoin::bip32::{Fingerprint, Xpub};
use std::str::FromStr;

fn dummy_xpub() -> Xpub {
    Xpub::from_str("xpub661MyMwAqRbcFLqTBCNzuoj4FYE1xRxmCjrSWC6LUjKHo46Du4NacKgxdrJPWhzLjkPsXqnjAUwn1raMSWfxWZKysPoBNQMZMs8b5JM8egC").unwrap()
}

#[tokio::test]
async fn no_adapters_is_not_connected() {
    let registry = Registry::new();
    let path: Bip32Path = "m/84'/0'/0'".parse().unwrap();
    assert!(matches!(registry.get_xpub(&path).await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn ambiguous_without_explicit_device_type() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Ledger, Fingerprint::from([1, 2, 3, 4]), dummy_xpub())))
        .await;
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Trezor, Fingerprint::from([5, 6, 7, 8]), dummy_xpub())))
        .await;

    assert!(matches!(registry.connect(None).await, Err(Error::Ambiguous)));
    assert!(registry.connect(Some(DeviceKind::Trezor)).await.is_ok());
}

#[tokio::test]
async fn sole_adapter_resolves_without_explicit_type() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::BitBox02, Fingerprint::from([9, 9, 9, 9]), dummy_xpub())))
        .await;

    let descriptor = registry.connect(None).await.unwrap();
    assert_eq!(descriptor.kind, DeviceKind::BitBox02);
}

#[tokio::test]
async fn connecting_a_different_type_disconnects_the_previous_one() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Ledger, Fingerprint::from([1, 1, 1, 1]), dummy_xpub())))
        .await;
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Jade, Fingerprint::from([2, 2, 2, 2]), dummy_xpub())))
        .await;

    registry.connect(Some(DeviceKind::Ledger)).await.unwrap();
    assert_eq!(registry.get_device().await.unwrap().kind, DeviceKind::Ledger);

    registry.connect(Some(DeviceKind::Jade)).await.unwrap();
    let active = registry.get_device().await.unwrap();
    assert_eq!(active.kind, DeviceKind::Jade);
}

#[tokio::test]
async fn disconnect_then_disconnect_again_is_not_an_error() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Ledger, Fingerprint::from([1, 2, 3, 4]), dummy_xpub())))
        .await;
    registry.connect(Some(DeviceKind::Ledger)).await.unwrap();
    registry.disconnect().await.unwrap();
    registry.disconnect().await.unwrap();
    assert!(registry.get_device().await.is_none());
}

#[tokio::test]
async fn not_a_cosigner_error_keeps_session_open() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Trezor, Fingerprint::from([0x11, 0x11, 0x22, 0x22]), dummy_xpub())))
        .await;
    registry.connect(Some(DeviceKind::Trezor)).await.unwrap();

    let err = Error::NotACosigner {
        expected: vec!["aaaaaaaa".to_string(), "bbbbbbbb".to_string(), "cccccccc".to_string()],
    };
    assert!(err.keeps_session_open());
    assert!(err.to_string().contains("aaaaaaaa"));
}

#[tokio::test]
async fn user_abort_keeps_session_open_for_a_retry() {
    let registry = Registry::new();
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Ledger, Fingerprint::from([3, 3, 3, 3]), dummy_xpub())))
        .await;
    registry.connect(Some(DeviceKind::Ledger)).await.unwrap();

    assert!(Error::UserAbort.keeps_session_open());

    // A retried sign_psbt is permitted: the mock adapter stays connected and answers normally.
    let response = registry.sign_psbt(SignRequest::new(empty_psbt())).await.unwrap();
    assert_eq!(response.signature_count, 0);
}

#[tokio::test]
async fn sign_psbt_routes_to_the_active_adapter_and_returns_its_response() {
    let registry = Registry::new();
    let fingerprint = Fingerprint::from([4, 4, 4, 4]);
    registry
        .register_adapter(Box::new(MockAdapter::new(DeviceKind::Ledger, fingerprint, dummy_xpub())))
        .await;
    registry.connect(Some(DeviceKind::Ledger)).await.unwrap();

    let psbt = empty_psbt();
    let response: SignResponse = registry.sign_psbt(SignRequest::new(psbt)).await.unwrap();
    assert_eq!(response.signature_count, 0);
    assert!(response.raw_tx.is_none());
}
