//! Small standalone utilities shared by the transport, registry, and
//! broker crates: the RPC sequence counter, the broker-id hash-key
//! derivation, the worker→address routing cache, and the retry backoff
//! driver.

pub mod address_cache;
pub mod backoff;
pub mod hash_key;
pub mod sequence;

pub use address_cache::AddressCache;
pub use backoff::Backoff;
pub use hash_key::broker_hash_key;
pub use sequence::CyclicCounter;
