//! Client-side synchronization of server data.
//!
//! - [`key`]: hierarchical query keys
//! - [`cache`]: keyed cache with stale-while-revalidate and an ordering guard
//! - [`invalidation`]: which keys a write affects
//! - [`mutation`]: writes that invalidate on success
//! - [`search`]: debounced search input

pub mod cache;
pub mod invalidation;
pub mod key;
pub mod mutation;
pub mod search;

pub use cache::{loader, CacheEntry, Loader, QueryCache, QueryStatus, Subscription};
pub use invalidation::{EntityRule, InvalidationRules, Operation, RelatedDetail, STANDARD_RULES};
pub use key::{KeyPart, QueryKey};
pub use mutation::{MutationDescriptor, MutationPipeline};
pub use search::{DebounceSession, DebouncedSearch};
