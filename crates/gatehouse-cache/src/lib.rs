// In-memory expiry cache and single-flight deduplication used by the
// gatehouse request path. Both are string-keyed: callers hash or otherwise
// normalize their identities before storing.
pub mod expiry;
pub mod singleflight;

pub use expiry::{CacheEntry, ExpiryCache};
pub use singleflight::SingleFlight;
