//! Entity model shared by every storage backend.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Marker trait implemented by all types that can be stored through a
/// [`crate::Store`].
///
/// An entity carries its own identity and optimistic-concurrency token so
/// that backends never need to invent a side index to recover them.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable name of the entity's type, used to namespace keys and to name
    /// the SQL backend's table.
    fn type_name() -> &'static str;

    /// Application-supplied identifier, unique within the entity type.
    fn id(&self) -> &str;

    /// Monotonically non-decreasing version. The SQL backend auto-bumps
    /// this on update unless the caller supplies an explicit value; other
    /// backends persist whatever the caller last set.
    fn version(&self) -> u64;

    /// Overwrite the version, used by backends after they assign one.
    fn set_version(&mut self, version: u64);

    /// Opaque optimistic-concurrency token. `None` if the entity type does
    /// not use etags.
    fn etag(&self) -> Option<&str> {
        None
    }
}

/// Derive the default storage key for an entity: `<TypeName>/<id>`.
pub fn default_key<T: Entity>(entity: &T) -> String {
    format!("{}/{}", T::type_name(), entity.id())
}

/// Side-band columns tracked alongside every stored value.
///
/// The SQL backend persists these as real columns; the in-memory and
/// file-system backends embed them in the serialized blob and re-extract
/// them on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The application entity as supplied by the caller.
    pub value: T,
    /// Side-band version, independent of any version field the entity
    /// itself carries (the two are kept in sync by [`crate::Store`] impls).
    pub version: u64,
    /// Creation timestamp, set once on first save.
    pub created_at: DateTime<Utc>,
    /// Last-write timestamp, refreshed on every save.
    pub updated_at: DateTime<Utc>,
}

impl<T: Entity> Envelope<T> {
    /// Wrap a freshly-saved entity with brand-new side-band columns.
    pub fn new(value: T) -> Self {
        let now = Utc::now();
        let version = value.version();
        Self {
            value,
            version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the next envelope for an update: the side-band `version`
    /// tracks whatever the entity itself reports, `created_at` carries
    /// forward, `updated_at` refreshes. Backends that need auto-incrementing
    /// versions (the SQL backend's upsert) compute that explicitly before
    /// calling this.
    pub fn update(previous: &Envelope<T>, value: T) -> Self {
        Self {
            version: value.version(),
            value,
            created_at: previous.created_at,
            updated_at: Utc::now(),
        }
    }
}
