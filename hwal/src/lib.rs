pub mod adapters;
pub mod codec;
pub mod config;
pub mod error;
pub mod finalize;
pub mod multisig;
pub mod path;
pub mod psbt;
pub mod registry;
pub mod transport;
pub mod xpub;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use miniscript;

pub use crate::adapters::{
    Capability, DeviceDescriptor, DeviceKind, RefTxFetcher, ScriptType, SignRequest, SignResponse,
    XpubResult, HWI,
};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::path::Bip32Path;
pub use crate::registry::Registry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a `Registry` with every vendor adapter this build was compiled with (features
/// `hid`/`usb`/`serial`/`bridge`, and `config.transports`' individual toggles), wired up with
/// `config`'s Trezor bridge URL and Jade serial path.
pub async fn default_registry(config: &Config) -> Registry {
    let registry = Registry::new();

    #[cfg(feature = "hid")]
    if config.transports.hid_enabled {
        registry
            .register_adapter(Box::new(crate::adapters::ledger::LedgerAdapter::new()))
            .await;
    }

    #[cfg(feature = "bridge")]
    if config.transports.bridge_enabled {
        let trezor = crate::adapters::trezor::TrezorAdapter::new()
            .with_bridge_url(config.trezor_bridge_url.clone())
            .with_timeout(config.roundtrip_timeout_secs);
        registry.register_adapter(Box::new(trezor)).await;
    }

    #[cfg(feature = "usb")]
    if config.transports.usb_enabled {
        let bitbox = crate::adapters::bitbox::BitBox02Adapter::new().with_timeout(config.roundtrip_timeout_secs);
        registry.register_adapter(Box::new(bitbox)).await;
    }

    #[cfg(feature = "serial")]
    if config.transports.serial_enabled {
        let jade = crate::adapters::jade::JadeAdapter::new()
            .with_serial_path(config.jade_serial_path.clone())
            .with_timeout(config.roundtrip_timeout_secs);
        registry.register_adapter(Box::new(jade)).await;
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_reports_not_connected() {
        let registry = Registry::new();
        let path: Bip32Path = "m/84'/0'/0'".parse().unwrap();
        assert!(matches!(registry.get_xpub(&path).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn default_registry_registers_every_enabled_adapter() {
        let config = Config::default();
        let registry = default_registry(&config).await;
        let devices = registry.enumerate_devices().await;
        assert!(devices.is_empty());
    }
}
