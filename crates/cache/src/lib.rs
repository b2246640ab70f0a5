//! Cache-aside read acceleration.
//!
//! Queries opt in through [`Cacheable`], naming a key built with
//! [`CacheKey`] and a time to live. [`CacheAside`] serves hits, runs the
//! handler on a miss and caches successful responses. Writers invalidate by
//! exact key or by namespace prefix.

pub mod behavior;
pub mod error;
pub mod key;
pub mod store;

pub use behavior::{CacheAside, CachePolicy, Cacheable, CacheableResponse};
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use store::{CacheStore, InMemoryCacheStore};
