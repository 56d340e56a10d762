//! shiftgrid-state: domain types and the embedded state store.
//!
//! Backed by [redb](https://docs.rs/redb). The store keeps the records an
//! operator needs after a crash or a failed release: pipeline runs (with
//! their per-tier plans), instance slots, and the datastore role history.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Slots use `{tier}:{instance_id}` keys so a tier can be listed with a
//! prefix scan; role events use zero-padded sequence numbers so a table
//! scan returns them in append order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
