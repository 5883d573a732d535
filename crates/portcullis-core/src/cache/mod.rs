//! Response caching: canonical keys, the stored-entry wire format, the
//! negative-cache bloom filter, and the TTL + stale-while-revalidate service
//! with single-flight coalescing.

pub mod bloom;
pub mod entry;
pub mod key;
pub mod service;

pub use bloom::{BloomFilter, BloomProbe};
pub use entry::{CacheEntry, EntryCodecError, Freshness};
pub use key::CacheKeyBuilder;
pub use service::{CacheLookup, CacheSettings, CoalescedFetch, FetchPayload, ResponseCache};
