//! venuedesk core - client-side data synchronization for venue administration.
//!
//! Server data is read through a keyed query cache with stale-while-revalidate
//! semantics, written through a mutation pipeline that invalidates every
//! affected view, and searched through a debounced input controller. Failures
//! from the REST backend are normalized into a closed set of error records.

pub mod api;
pub mod config;
pub mod models;
pub mod store;
pub mod sync;

pub use api::{ApiClient, EntityService, ErrorKind, ErrorRecord, RawFailure, Resource};
pub use config::{Config, SyncConfig};
pub use store::SyncStore;
