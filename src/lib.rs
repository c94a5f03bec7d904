//! Time-bounded cache for TLS leaf certificates signed on demand.
//!
//! A TLS-intercepting proxy needs a certificate for every host it
//! terminates. Key generation and signing are expensive, so this crate
//! keeps signed certificates around for a configurable TTL and makes sure
//! only one certificate is being generated at a time.
//!
//! # Architecture
//!
//! - [`ExpiringMap`]: concurrent key/value store with per-entry TTL. Lookups
//!   hide expired entries; a background [`SweepTask`] deletes them.
//! - [`CachedSigner`]: canonicalizes a host set into a cache key, serves hits
//!   from the store and runs the [`HostSigner`] for misses while holding a
//!   single, global generation slot.
//! - [`RcgenSigner`] / [`CaState`]: ephemeral CA and rcgen-based leaf signing.
//! - [`TlsAcceptor`]: terminates TLS using certificates from the cache.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use leaf_cert_cache::{CaState, CachedSigner, RcgenSigner};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let ca = Arc::new(CaState::generate()?);
//! let signer = CachedSigner::new(RcgenSigner::default(), Duration::from_secs(600));
//!
//! let hosts = vec!["example.com".to_string(), "www.example.com".to_string()];
//! let cert = signer.sign_host(&ca, &hosts).await?;
//! assert_eq!(cert.cert.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod cache;
mod config;
pub mod tls;

pub use ca::{CaError, CaState, RcgenSigner};
pub use cache::{
    CachedSigner, ExpiringMap, HostSigner, SignHostError, SweepTask, canonical_key,
};
pub use config::{CacheConfig, ConfigError};
pub use tls::{AcceptError, TlsAcceptor};
