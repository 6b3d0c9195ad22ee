//! Small caching primitives shared by the allocator and the launchers.

mod expiring;
mod lazy;

pub use expiring::{ExpirationPolicy, ExpiringMap, RemovalReason};
pub use lazy::{LazyInitError, LazyWithRetry};
