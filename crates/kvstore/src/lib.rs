#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore** – Configuration and backend factory for the kvstore
//! persistence kernel.
//!
//! Application code reads a [`config::PersistenceConfig`] (C2) and hands
//! it to [`factory::create`] (C10) to get back a `Arc<dyn
//! kvstore_core::Store<T>>` for whichever backend a named provider
//! resolves to — [`kvstore_memory`], [`kvstore_fs`], or [`kvstore_sql`].
//! Callers that need atomicity across more than one provider compose them
//! with [`kvstore_txn`].

pub mod config;
pub mod factory;

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use crate::config::{CircuitBreakerConfig, PersistenceConfig, ProviderConfig, RetryConfig};
    pub use crate::factory::{create, create_default, FactoryError};
    pub use kvstore_core::{Entity, Predicate, Store, StoreError, StoreResult};
    pub use kvstore_txn::prelude::*;
}
