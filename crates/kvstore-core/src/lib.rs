#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore-core** – Core storage abstractions for the kvstore persistence
//! kernel.
//!
//! This crate defines the entity model, the CRUD provider contract every
//! backend implements, and the shared error vocabulary. It has no knowledge
//! of any concrete medium: storage drivers (in-memory, file-system, SQL)
//! live in their own crates and depend on this one.

mod codec;
mod entity;
mod error;
mod predicate;
mod store;

pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use entity::{default_key, Entity, Envelope};
pub use error::{Classify, StoreError, StoreResult};
pub use predicate::Predicate;
pub use store::Store;

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        default_key, Classify, Codec, Entity, Envelope, JsonCodec, MsgPackCodec, Predicate,
        Store, StoreError, StoreResult,
    };
}
