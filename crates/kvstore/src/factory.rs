//! C10: instantiate a backend by name for a given entity type.
//!
//! Per the redesign notes, backend discovery is an explicit match over a
//! type tag rather than reflection over loaded assemblies: every backend
//! this crate knows about has one arm below, keyed by the same string the
//! config's `type` field carries.

use std::sync::Arc;
use std::time::Duration;

use kvstore_core::{Entity, Store};
use kvstore_fs::{FileSystemBackend, FsConfig};
use kvstore_memory::{MemoryBackend, MemoryConfig};
use kvstore_sql::{SqlBackend, SqlConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{PersistenceConfig, ProviderConfig};

/// Errors the factory can surface.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The config's `type` field named a backend this factory doesn't
    /// know how to build.
    #[error("no backend registered for provider type '{0}'")]
    ProviderNotFound(String),
    /// The provider's `settings` block didn't deserialize into the
    /// backend's expected settings shape.
    #[error("invalid settings for provider '{provider}': {source}")]
    InvalidSettings {
        /// Name of the provider whose settings failed to parse.
        provider: String,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// Constructing the backend itself failed (e.g. opening the SQL file).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    /// The backend's own open/construction step failed.
    #[error(transparent)]
    Store(#[from] kvstore_core::StoreError),
}

/// Build a CRUD provider for entity type `T` from the provider named
/// `provider_name` in `config`.
///
/// Returns `Ok(None)` when the name is absent from config or the provider
/// is disabled; returns `ProviderNotFound` when the name resolves but its
/// `type` tag is unknown.
pub async fn create<T: Entity>(
    config: &PersistenceConfig,
    provider_name: &str,
) -> Result<Option<Arc<dyn Store<T>>>, FactoryError> {
    let Some(provider) = config.provider(provider_name) else {
        return Ok(None);
    };
    if !provider.enabled {
        return Ok(None);
    }

    // snake_case tags, matching every other field this crate deserializes
    // from config; not the PascalCase used in prose elsewhere.
    let backend: Arc<dyn Store<T>> = match provider.provider_type.as_str() {
        "in_memory" => Arc::new(build_in_memory::<T>(provider)?),
        "file_system" => Arc::new(build_file_system::<T>(provider).await?),
        "sqlite" => Arc::new(build_sqlite::<T>(provider).await?),
        other => return Err(FactoryError::ProviderNotFound(other.to_string())),
    };
    Ok(Some(backend))
}

/// Build a provider using `config.default_provider`, if one is set.
pub async fn create_default<T: Entity>(
    config: &PersistenceConfig,
) -> Result<Option<Arc<dyn Store<T>>>, FactoryError> {
    match &config.default_provider {
        Some(name) => create::<T>(config, name).await,
        None => Ok(None),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct InMemorySettings {
    default_ttl_ms: Option<u64>,
    max_cache_size: Option<usize>,
    enable_eviction: Option<bool>,
    eviction_interval_ms: Option<u64>,
}

fn build_in_memory<T: Entity>(provider: &ProviderConfig) -> Result<MemoryBackend<T>, FactoryError> {
    let settings: InMemorySettings =
        serde_json::from_value(provider.settings.clone()).map_err(|source| {
            FactoryError::InvalidSettings {
                provider: provider.provider_type.clone(),
                source,
            }
        })?;
    let mut config = MemoryConfig::default();
    if let Some(ttl) = settings.default_ttl_ms {
        config.default_ttl = Some(Duration::from_millis(ttl));
    }
    if let Some(max) = settings.max_cache_size {
        config.max_cache_size = max;
    }
    if let Some(enabled) = settings.enable_eviction {
        config.enable_eviction = enabled;
    }
    if let Some(interval) = settings.eviction_interval_ms {
        config.eviction_interval = Duration::from_millis(interval);
    }
    Ok(MemoryBackend::with_config(config))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
struct FileSystemSettings {
    file_path: String,
    use_subdirectories: Option<bool>,
    max_concurrent_files: Option<usize>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

async fn build_file_system<T: Entity>(
    provider: &ProviderConfig,
) -> Result<FileSystemBackend<T>, FactoryError> {
    let settings: FileSystemSettings =
        serde_json::from_value(provider.settings.clone()).map_err(|source| {
            FactoryError::InvalidSettings {
                provider: provider.provider_type.clone(),
                source,
            }
        })?;
    let mut config = FsConfig::new(settings.file_path);
    if let Some(use_subdirectories) = settings.use_subdirectories {
        config.use_subdirectories = use_subdirectories;
    }
    if let Some(max) = settings.max_concurrent_files {
        config.max_concurrent_files = max;
    }
    if let Some(retries) = settings.max_retries {
        config.max_retries = retries;
    }
    if let Some(delay) = settings.retry_delay_ms {
        config.retry_delay_ms = delay;
    }
    Ok(FileSystemBackend::open(config).await?)
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
struct SqliteSettings {
    data_source: String,
    schema: Option<String>,
    command_timeout_secs: Option<u64>,
}

async fn build_sqlite<T: Entity>(provider: &ProviderConfig) -> Result<SqlBackend<T>, FactoryError> {
    let settings: SqliteSettings =
        serde_json::from_value(provider.settings.clone()).map_err(|source| {
            FactoryError::InvalidSettings {
                provider: provider.provider_type.clone(),
                source,
            }
        })?;
    let mut config = SqlConfig::new(settings.data_source);
    if let Some(schema) = settings.schema {
        config.schema = schema;
    }
    if let Some(secs) = settings.command_timeout_secs {
        config.command_timeout = Duration::from_secs(secs);
    }
    Ok(SqlBackend::open(config).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Clone, Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Widget {
        id: String,
        version: u64,
        name: String,
    }

    impl Entity for Widget {
        fn type_name() -> &'static str {
            "Widget"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn config_with(provider_type: &str, settings: serde_json::Value, enabled: bool) -> PersistenceConfig {
        let mut providers = HashMap::new();
        providers.insert(
            "p".to_string(),
            ProviderConfig {
                provider_type: provider_type.to_string(),
                enabled,
                settings,
                retry: Default::default(),
                circuit_breaker: Default::default(),
            },
        );
        PersistenceConfig {
            default_provider: Some("p".to_string()),
            providers,
        }
    }

    #[tokio::test]
    async fn creates_an_in_memory_backend_from_settings() {
        let config = config_with("in_memory", serde_json::json!({ "max_cache_size": 5 }), true);
        let backend = create::<Widget>(&config, "p").await.unwrap().unwrap();
        backend
            .save(
                "Widget/a",
                Widget {
                    id: "a".into(),
                    version: 0,
                    name: "X".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(backend.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn creates_a_file_system_backend_rooted_at_the_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(
            "file_system",
            serde_json::json!({ "file_path": dir.path().to_str().unwrap() }),
            true,
        );
        let backend = create::<Widget>(&config, "p").await.unwrap().unwrap();
        backend
            .save(
                "Widget/a",
                Widget {
                    id: "a".into(),
                    version: 0,
                    name: "X".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(backend.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_provider_yields_none() {
        let config = config_with("in_memory", serde_json::json!({}), false);
        assert!(create::<Widget>(&config, "p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn absent_provider_yields_none() {
        let config = PersistenceConfig {
            default_provider: None,
            providers: HashMap::new(),
        };
        assert!(create::<Widget>(&config, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_type_tag_is_a_provider_not_found_error() {
        let config = config_with("carrier-pigeon", serde_json::json!({}), true);
        let result = create::<Widget>(&config, "p").await;
        match result {
            Err(FactoryError::ProviderNotFound(tag)) => assert_eq!(tag, "carrier-pigeon"),
            _ => panic!("expected ProviderNotFound"),
        }
    }
}
