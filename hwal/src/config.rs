//! TOML-backed configuration for default timeouts, the Trezor bridge URL, and which transports
//! are enabled, following `lianad/src/config.rs`'s `deserialize_with` helper pattern.

use std::{path::PathBuf, time::Duration};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn serialize_duration<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_secs())
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:21325".to_string()
}

fn default_serial_path() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_true() -> bool {
    true
}

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string).map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

fn serialize_to_string<T: std::fmt::Display, S: Serializer>(field: T, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

/// Which transports are enabled; useful in CI/test environments with no physical USB/HID access.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_true")]
    pub hid_enabled: bool,
    #[serde(default = "default_true")]
    pub usb_enabled: bool,
    #[serde(default = "default_true")]
    pub serial_enabled: bool,
    #[serde(default = "default_true")]
    pub bridge_enabled: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            hid_enabled: true,
            usb_enabled: true,
            serial_enabled: true,
            bridge_enabled: true,
        }
    }
}

/// Static configuration for `hwal`'s adapters and registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// What messages to log.
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// Per-vendor roundtrip deadline; exceeding it surfaces `Error::Timeout`.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_timeout"
    )]
    pub roundtrip_timeout_secs: Duration,
    /// Base URL of the Trezor Bridge daemon.
    #[serde(default = "default_bridge_url")]
    pub trezor_bridge_url: String,
    /// Serial device path for the Jade.
    #[serde(default = "default_serial_path")]
    pub jade_serial_path: String,
    #[serde(default)]
    pub transports: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_loglevel(),
            roundtrip_timeout_secs: default_timeout(),
            trezor_bridge_url: default_bridge_url(),
            jade_serial_path: default_serial_path(),
            transports: TransportConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// `~/.hwal/` on Linux, the platform config directory elsewhere, mirroring
/// `lianad/src/config.rs::config_folder_path`.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    let mut path = configs_dir?;
    #[cfg(target_os = "linux")]
    path.push(".hwal");

    #[cfg(not(target_os = "linux"))]
    path.push("Hwal");

    Some(path)
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("hwal.toml");
        path
    })
}

impl Config {
    /// Read configuration from `custom_path`, or the platform default location, falling back to
    /// `Config::default()` for any field not present in the file.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = custom_path.or_else(config_file_path).ok_or(ConfigError::FileNotFound)?;
        let bytes = std::fs::read(config_file)?;
        toml::from_slice::<Config>(&bytes)
            .map_err(|e| ConfigError::Unexpected(format!("Parsing configuration file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let toml_str = "";
        let parsed: Config = toml::from_str(toml_str).expect("empty config is valid");
        assert_eq!(parsed.log_level, log::LevelFilter::Info);
        assert_eq!(parsed.roundtrip_timeout_secs, Duration::from_secs(30));
        assert!(parsed.transports.hid_enabled);
    }

    #[test]
    fn round_trips_through_toml() {
        let toml_str = r#"
            log_level = 'debug'
            roundtrip_timeout_secs = 45
            trezor_bridge_url = 'http://127.0.0.1:21325'
            jade_serial_path = '/dev/ttyUSB0'

            [transports]
            hid_enabled = true
            usb_enabled = false
            serial_enabled = true
            bridge_enabled = true
            "#
        .trim_start()
        .replace("            ", "");
        let parsed: Config = toml::from_str(&toml_str).expect("deserializing toml_str");
        let serialized = toml::to_string_pretty(&parsed).expect("serializing to toml");
        assert_eq!(toml_str, serialized);
        assert!(!parsed.transports.usb_enabled);
    }

    #[test]
    fn rejects_unparsable_log_level() {
        let toml_str = "log_level = 'not-a-level'\n";
        let result: Result<Config, toml::de::Error> = toml::from_str(toml_str);
        result.expect_err("deserializing an invalid log_level");
    }
}
