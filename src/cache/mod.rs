//! Local read-through cache for list and detail queries.
//!
//! - Every successful remote fetch is written here immediately
//! - Every scope mount paints from here first, then refreshes from the network
//! - Storage failures degrade to cache misses; nothing depends on the cache for correctness

mod keys;
mod layer;
mod store;
mod traits;

pub use keys::CacheKey;
pub use layer::CacheLayer;
pub use store::{CacheEntry, LocalCacheStore};
pub use traits::{CacheResult, CacheSource, Cacheable};
