//! C2: resolve backend settings by named provider key.
//!
//! Shape (section names as the `config` crate sees them once flattened):
//!
//! ```text
//! persistence.default_provider = "<name>"
//! persistence.providers.<name> = {
//!     type = "in_memory" | "file_system" | "sqlite"
//!     enabled = true
//!     settings = { ... provider-specific ... }
//!     retry = { enabled, max_retries, initial_delay_ms, max_delay_ms, backoff_multiplier }
//!     circuit_breaker = { enabled, failure_threshold, timeout_ms }
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

/// Top-level persistence configuration: which provider is the default and
/// the settings for every named provider.
#[derive(Clone, Debug, Deserialize)]
pub struct PersistenceConfig {
    /// Name of the provider `Factory::create` resolves when none is given
    /// explicitly.
    pub default_provider: Option<String>,
    /// Every configured provider, keyed by the name callers pass to
    /// `Factory::create`.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Configuration for a single named provider.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    /// Backend type tag: `in_memory`, `file_system`, or `sqlite`.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Whether the factory should construct this provider at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Provider-specific settings, deserialized by each backend
    /// constructor into its own settings struct.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Retry policy for callers using this provider with the retry
    /// helper. Not enforced by the backend itself.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit-breaker policy. Tracked as configuration only: no circuit
    /// breaker is implemented by the core kernel.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_enabled() -> bool {
    true
}

/// Retry policy shape, consumed by application code building
/// `kvstore_txn::execute_with_retry` calls around a provider.
#[derive(Clone, Debug, Deserialize)]
pub struct RetryConfig {
    /// Whether retry is enabled for this provider.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each transient failure.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Circuit-breaker policy shape. Configuration only — see module docs.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct CircuitBreakerConfig {
    /// Whether the circuit breaker is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    #[serde(default)]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial request, in
    /// milliseconds.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl PersistenceConfig {
    /// Load configuration from `sources` (applied in order, later sources
    /// overriding earlier ones) plus environment variables prefixed
    /// `KVSTORE_`, using `__` as the nesting separator
    /// (e.g. `KVSTORE_PERSISTENCE__DEFAULT_PROVIDER`).
    pub fn load(sources: &[config::File<config::FileSourceFile, config::FileFormat>]) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        for source in sources {
            builder = builder.add_source(source.clone());
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KVSTORE")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder.build()?;
        Ok(raw.try_deserialize::<Wrapper>()?.persistence)
    }

    /// Look up a provider's configuration by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

#[derive(Deserialize)]
struct Wrapper {
    persistence: PersistenceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_settings_deserialize_into_a_provider_specific_struct() {
        #[derive(Deserialize)]
        struct InMemorySettings {
            max_cache_size: usize,
        }

        let provider = ProviderConfig {
            provider_type: "in_memory".to_string(),
            enabled: true,
            settings: serde_json::json!({ "max_cache_size": 128 }),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        };
        let settings: InMemorySettings = serde_json::from_value(provider.settings).unwrap();
        assert_eq!(settings.max_cache_size, 128);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_documented_defaults() {
        let json = serde_json::json!({
            "persistence": {
                "default_provider": "cache",
                "providers": {
                    "cache": { "type": "in_memory" }
                }
            }
        });
        let wrapper: Wrapper = serde_json::from_value(json).unwrap();
        let provider = wrapper.persistence.provider("cache").unwrap();
        assert!(provider.enabled);
        assert_eq!(provider.retry.max_retries, 3);
        assert!(!provider.retry.enabled);
    }
}
