//! Configuration for the swarm runtime.
//!
//! Unlike most of this crate, [`Config`] does introduce a file-parsing
//! dependency (`toml`) — the swarm genuinely needs a file on disk describing
//! provider endpoints and limits. Loading is a single explicit path, not a
//! search across candidate locations: layered multi-location discovery is
//! out of scope.
//!
//! # Example
//!
//! ```rust,no_run
//! use zoea_nova::config::Config;
//!
//! let mut config = Config::load("zoea.toml")?;
//! config.apply_env_overrides();
//! config.validate().map_err(|errs| format!("{} config errors", errs.len()))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-provider configuration: where to reach it, which model to request,
/// and the token-bucket rate limit applied before every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Sustained requests per second.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    /// Burst capacity on top of the sustained rate.
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,
    /// Bearer token, if the provider requires one. Read from the field
    /// directly or overridden via `ZOEA_PROVIDERS_<NAME>_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_rate_limit() -> f64 {
    2.0
}

fn default_rate_burst() -> u32 {
    4
}

/// Swarm-wide limits: how many myses may exist at once and what they default to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_max_myses")]
    pub max_myses: usize,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
}

fn default_max_myses() -> usize {
    16
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_myses: default_max_myses(),
            default_provider: None,
            default_model: None,
        }
    }
}

/// Top-level configuration object, deserialized from TOML and then
/// overridable from the process environment.
///
/// # Example
///
/// ```rust
/// use zoea_nova::config::Config;
///
/// let toml = r#"
/// [swarm]
/// max_myses = 8
///
/// [upstream]
/// tool_server_url = "http://localhost:9000"
///
/// [providers.local]
/// endpoint = "http://localhost:8000/v1/chat/completions"
/// model = "local-model"
/// "#;
/// let config: Config = toml::from_str(toml).unwrap();
/// assert_eq!(config.swarm.max_myses, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub swarm: SwarmConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Where the upstream game tool server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub tool_server_url: String,
}

/// A single configuration validation failure. `validate()` collects every
/// one of these rather than stopping at the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MaxMysesOutOfRange(usize),
    UnknownDefaultProvider(String),
    EmptyUpstreamUrl,
    InvalidTemperature { provider: String, temperature_milli: i64 },
    NonPositiveRateLimit { provider: String },
    ZeroRateBurst { provider: String },
    NoProviders,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MaxMysesOutOfRange(n) => {
                write!(f, "swarm.max_myses must be in 1..=100, got {}", n)
            }
            ConfigError::UnknownDefaultProvider(name) => {
                write!(f, "swarm.default_provider {:?} is not in providers", name)
            }
            ConfigError::EmptyUpstreamUrl => write!(f, "upstream.tool_server_url must not be empty"),
            ConfigError::InvalidTemperature {
                provider,
                temperature_milli,
            } => write!(
                f,
                "provider {:?} temperature {} is out of [0, 2]",
                provider,
                *temperature_milli as f64 / 1000.0
            ),
            ConfigError::NonPositiveRateLimit { provider } => {
                write!(f, "provider {:?} rate_limit must be > 0", provider)
            }
            ConfigError::ZeroRateBurst { provider } => {
                write!(f, "provider {:?} rate_burst must be >= 1", provider)
            }
            ConfigError::NoProviders => write!(f, "at least one provider must be configured"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Parse configuration from a TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    /// Apply `ZOEA_<SECTION>_<KEY>` environment overrides in place.
    ///
    /// Recognized variables:
    /// - `ZOEA_SWARM_MAX_MYSES`
    /// - `ZOEA_SWARM_DEFAULT_PROVIDER`
    /// - `ZOEA_UPSTREAM_TOOL_SERVER_URL`
    /// - `ZOEA_PROVIDERS_<NAME>_ENDPOINT`, `_MODEL`, `_TEMPERATURE`,
    ///   `_RATE_LIMIT`, `_RATE_BURST`, `_API_KEY` (name upper-cased)
    ///
    /// A variable present but unparsable for its field is logged and
    /// ignored — the file value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ZOEA_SWARM_MAX_MYSES") {
            match v.parse::<usize>() {
                Ok(n) => self.swarm.max_myses = n,
                Err(_) => log::warn!("ignoring invalid ZOEA_SWARM_MAX_MYSES={:?}", v),
            }
        }
        if let Ok(v) = std::env::var("ZOEA_SWARM_DEFAULT_PROVIDER") {
            self.swarm.default_provider = Some(v);
        }
        if let Ok(v) = std::env::var("ZOEA_UPSTREAM_TOOL_SERVER_URL") {
            self.upstream.tool_server_url = v;
        }

        for (name, provider) in self.providers.iter_mut() {
            let prefix = format!("ZOEA_PROVIDERS_{}_", name.to_uppercase());
            if let Ok(v) = std::env::var(format!("{}ENDPOINT", prefix)) {
                provider.endpoint = v;
            }
            if let Ok(v) = std::env::var(format!("{}MODEL", prefix)) {
                provider.model = v;
            }
            if let Ok(v) = std::env::var(format!("{}TEMPERATURE", prefix)) {
                match v.parse::<f32>() {
                    Ok(t) => provider.temperature = t,
                    Err(_) => log::warn!("ignoring invalid {}TEMPERATURE={:?}", prefix, v),
                }
            }
            if let Ok(v) = std::env::var(format!("{}RATE_LIMIT", prefix)) {
                match v.parse::<f64>() {
                    Ok(r) => provider.rate_limit = r,
                    Err(_) => log::warn!("ignoring invalid {}RATE_LIMIT={:?}", prefix, v),
                }
            }
            if let Ok(v) = std::env::var(format!("{}RATE_BURST", prefix)) {
                match v.parse::<u32>() {
                    Ok(b) => provider.rate_burst = b,
                    Err(_) => log::warn!("ignoring invalid {}RATE_BURST={:?}", prefix, v),
                }
            }
            if let Ok(v) = std::env::var(format!("{}API_KEY", prefix)) {
                provider.api_key = Some(v);
            }
        }
    }

    /// Validate the configuration, collecting every violation instead of
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if !(1..=100).contains(&self.swarm.max_myses) {
            errors.push(ConfigError::MaxMysesOutOfRange(self.swarm.max_myses));
        }
        if let Some(default_provider) = &self.swarm.default_provider {
            if !self.providers.contains_key(default_provider) {
                errors.push(ConfigError::UnknownDefaultProvider(default_provider.clone()));
            }
        }
        if self.upstream.tool_server_url.trim().is_empty() {
            errors.push(ConfigError::EmptyUpstreamUrl);
        }
        if self.providers.is_empty() {
            errors.push(ConfigError::NoProviders);
        }
        for (name, provider) in &self.providers {
            if !(0.0..=2.0).contains(&provider.temperature) {
                errors.push(ConfigError::InvalidTemperature {
                    provider: name.clone(),
                    temperature_milli: (provider.temperature as f64 * 1000.0) as i64,
                });
            }
            if provider.rate_limit <= 0.0 {
                errors.push(ConfigError::NonPositiveRateLimit {
                    provider: name.clone(),
                });
            }
            if provider.rate_burst == 0 {
                errors.push(ConfigError::ZeroRateBurst {
                    provider: name.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        let mut providers = HashMap::new();
        providers.insert(
            "local".to_string(),
            ProviderConfig {
                endpoint: "http://localhost:8000".to_string(),
                model: "local-model".to_string(),
                temperature: 0.7,
                rate_limit: 2.0,
                rate_burst: 4,
                api_key: None,
            },
        );
        Config {
            swarm: SwarmConfig {
                max_myses: 8,
                default_provider: Some("local".to_string()),
                default_model: None,
            },
            upstream: UpstreamConfig {
                tool_server_url: "http://localhost:9000".to_string(),
            },
            providers,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn aggregates_every_violation() {
        let mut config = sample();
        config.swarm.max_myses = 0;
        config.swarm.default_provider = Some("missing".to_string());
        config.upstream.tool_server_url = "  ".to_string();
        config.providers.get_mut("local").unwrap().temperature = 5.0;
        config.providers.get_mut("local").unwrap().rate_limit = -1.0;
        config.providers.get_mut("local").unwrap().rate_burst = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn env_override_replaces_file_value() {
        let mut config = sample();
        std::env::set_var("ZOEA_SWARM_MAX_MYSES", "42");
        std::env::set_var("ZOEA_PROVIDERS_LOCAL_MODEL", "override-model");
        config.apply_env_overrides();
        std::env::remove_var("ZOEA_SWARM_MAX_MYSES");
        std::env::remove_var("ZOEA_PROVIDERS_LOCAL_MODEL");

        assert_eq!(config.swarm.max_myses, 42);
        assert_eq!(config.providers["local"].model, "override-model");
    }

    #[test]
    fn invalid_env_value_is_ignored() {
        let mut config = sample();
        std::env::set_var("ZOEA_SWARM_MAX_MYSES", "not-a-number");
        config.apply_env_overrides();
        std::env::remove_var("ZOEA_SWARM_MAX_MYSES");
        assert_eq!(config.swarm.max_myses, 8);
    }
}
