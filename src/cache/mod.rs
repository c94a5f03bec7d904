//! Leaf certificate caching.
//!
//! [`ExpiringMap`] holds signed certificates for a fixed TTL and sweeps stale
//! entries in the background. [`CachedSigner`] sits in front of a
//! [`HostSigner`] and makes sure at most one certificate is being generated at
//! any time.

mod expiring;
mod signer;

pub use expiring::{DEFAULT_SWEEP_INTERVAL, ExpiringMap, SweepTask};
pub use signer::{CachedSigner, HostSigner, SignHostError, canonical_key};
