//! Data models for the administration API.
//!
//! - `Entity`, `ListParams`: resource catalogue and list parameters
//! - `Venue`, `Contract`: venues and their contracts
//! - `Goal`, `Expense`: per-venue financial records
//! - `Owner`, `Permission`: owners and their access grants

pub mod access;
pub mod entity;
pub mod finance;
pub mod venue;

pub use access::{Owner, Permission};
pub use entity::{Entity, ListParams};
pub use finance::{format_amount, Expense, Goal};
pub use venue::{Contract, Venue};
