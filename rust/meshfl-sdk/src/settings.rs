//! Loading and validation of the settings of a node.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use url::Url;
use validator::{Validate, ValidationErrors};

use meshfl_core::{aggregator::AggregatorSettings, privacy::PrivacySettings};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub rendezvous: RendezvousSettings,
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    #[validate]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    #[validate]
    pub transport: TransportSettings,
    #[serde(default)]
    #[validate]
    pub privacy: PrivacySettings,
    #[serde(default)]
    pub log: LoggingSettings,
    #[serde(default)]
    #[validate]
    pub demo: DemoSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(config::File::from(path))?;
        settings.validate()?;
        Ok(settings)
    }

    fn load<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix("MESHFL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Rendezvous server settings.
pub struct RendezvousSettings {
    /// The base URL of the rendezvous server.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [rendezvous]
    /// url = "ws://127.0.0.1:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// MESHFL_RENDEZVOUS__URL=ws://127.0.0.1:8081
    /// ```
    pub url: Url,

    /// The task whose nodes this node aggregates with. Only nodes of the same task
    /// are grouped into rounds.
    pub task: String,
}

impl RendezvousSettings {
    /// Gets the websocket endpoint of the task.
    ///
    /// # Errors
    /// Fails if the task is not a valid URL path segment.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        self.url.join(&format!("/rendezvous/{}", self.task))
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// Round protocol settings.
pub struct ProtocolSettings {
    #[validate(range(min = 1))]
    #[serde(default = "default_minimum_ready_peers")]
    /// The minimal number of nodes, including the local one, a round requires.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// minimum_ready_peers = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// MESHFL_PROTOCOL__MINIMUM_READY_PEERS=3
    /// ```
    pub minimum_ready_peers: usize,

    #[validate(range(min = 1))]
    #[serde(default = "default_round_timeout_ms")]
    /// How long each step of a round may take, in milliseconds.
    pub round_timeout_ms: u64,
}

impl ProtocolSettings {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            minimum_ready_peers: default_minimum_ready_peers(),
            round_timeout_ms: default_round_timeout_ms(),
        }
    }
}

fn default_minimum_ready_peers() -> usize {
    3
}

fn default_round_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// Peer transport settings.
pub struct TransportSettings {
    #[serde(default = "default_bind_ip")]
    /// The address peer sockets are bound to.
    pub bind_ip: IpAddr,

    #[serde(default = "default_advertised_ip")]
    /// The address advertised to the peers in session descriptions.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [transport]
    /// advertised_ip = "192.168.1.12"
    /// ```
    pub advertised_ip: IpAddr,

    #[validate(range(min = 64, max = 65507))]
    #[serde(default = "default_max_message_size")]
    /// The largest datagram accepted from peers, in bytes.
    pub max_message_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            advertised_ip: default_advertised_ip(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_advertised_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_max_message_size() -> usize {
    16_384
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// Settings of the synthetic training loop of the node binary.
pub struct DemoSettings {
    #[validate(range(min = 1))]
    #[serde(default = "default_rounds")]
    /// The number of rounds to run.
    pub rounds: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_model_length")]
    /// The number of weights of the synthetic model.
    pub model_length: usize,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            model_length: default_model_length(),
        }
    }
}

fn default_rounds() -> u64 {
    10
}

fn default_model_length() -> usize {
    100
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "meshfl_sdk=debug,info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// MESHFL_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};

    use super::*;
    use meshfl_core::aggregator::ThresholdType;

    fn parse(toml: &str) -> Result<Settings, ConfigError> {
        Settings::load(File::from_str(toml, FileFormat::Toml))
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new(PathBuf::from("../../configs/node.toml")).is_ok());
        assert!(Settings::new(PathBuf::from("")).is_err());
    }

    #[test]
    fn test_defaults() {
        let settings = parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.rendezvous.endpoint().unwrap().as_str(),
            "ws://127.0.0.1:8081/rendezvous/task"
        );
        assert_eq!(settings.aggregator, AggregatorSettings::default());
        assert_eq!(settings.protocol.minimum_ready_peers, 3);
        assert_eq!(settings.protocol.round_timeout(), Duration::from_secs(10));
        assert_eq!(settings.transport.max_message_size, 16_384);
        assert_eq!(settings.privacy, PrivacySettings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_secure_scheme() {
        let settings = parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"

            [aggregator]
            scheme = "secure"
            max_share_value = 50.0

            [privacy]
            clipping_radius = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.aggregator,
            AggregatorSettings::Secure {
                max_share_value: 50.0
            }
        );
        assert_eq!(settings.privacy.clipping_radius, Some(2.0));
    }

    #[test]
    fn test_mean_threshold_type() {
        let settings = parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"

            [aggregator]
            scheme = "mean"
            threshold = 1.0
            threshold_type = "absolute"
            min_participants = 2
            "#,
        )
        .unwrap();
        assert_eq!(
            settings.aggregator,
            AggregatorSettings::Mean {
                threshold: 1.0,
                threshold_type: Some(ThresholdType::Absolute),
                round_cutoff: 0,
                min_participants: Some(2),
            }
        );
        assert!(settings.aggregator.build().is_ok());
    }

    #[test]
    fn test_validation() {
        let settings = parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"

            [protocol]
            minimum_ready_peers = 0

            [transport]
            max_message_size = 16
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_privacy_validation() {
        let settings = parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"

            [privacy]
            noise_scale = -1.0
            "#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_filter() {
        assert!(parse(
            r#"
            [rendezvous]
            url = "ws://127.0.0.1:8081"
            task = "task"

            [log]
            filter = "meshfl=loud"
            "#,
        )
        .is_err());
    }
}
