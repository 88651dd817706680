//! In-memory response caching for managed requests.
//!
//! This module provides the `RequestCache`, a store shared by every
//! request handle of an executor, keyed by `RequestSignature`. Entries are
//! JSON values stamped with the instant they were stored and are
//! considered fresh while younger than the caller's TTL.
//!
//! There is no capacity bound: entries are only replaced or explicitly
//! deleted. This is fine while the set of signatures is fixed by the
//! callers; a caller generating unbounded distinct signatures should
//! clear the cache itself.

pub mod store;

pub use store::{CacheEntry, RequestCache, RequestSignature};
