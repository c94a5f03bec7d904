//! CA certificate management for TLS interception.
//!
//! This module provides ephemeral CA generation and the rcgen-backed
//! [`HostSigner`](crate::cache::HostSigner) used to mint leaf certificates.

mod generator;

pub use generator::{CaError, CaResult, CaState, DEFAULT_LEAF_VALIDITY, RcgenSigner};
