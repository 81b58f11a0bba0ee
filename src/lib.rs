//! Floodgate - Admission Control and Rate Limiting
//!
//! This crate decides, per inbound request, whether the request may proceed
//! given the identifiers it carries (network address, account, credential,
//! public key) and a set of configured rules. Counters live either in process
//! or in Redis so that several instances can share one set of limits.

pub mod admission;
pub mod config;
pub mod error;
pub mod grpc;
pub mod nonce;
pub mod ratelimit;
pub mod store;
