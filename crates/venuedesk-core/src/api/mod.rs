//! REST adapter for the venue administration backend.
//!
//! [`ApiClient`] talks HTTP, [`Resource`] exposes one entity through the
//! [`EntityService`] contract, and [`classify`] turns whatever went wrong
//! into an [`ErrorRecord`] the rest of the crate can show.

pub mod client;
pub mod error;
pub mod service;

pub use client::ApiClient;
pub use error::{classify, ErrorBody, ErrorKind, ErrorRecord, RawFailure};
pub use service::{EntityService, Resource};
