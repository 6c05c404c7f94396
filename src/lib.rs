//! Turnstile - Per-client Request Quota Gateway
//!
//! This crate implements an HTTP gateway that counts each client's requests
//! against a quota held in a shared atomic store and forwards admitted
//! requests to a single upstream. Two counting strategies are available:
//! a fixed window counter and a sliding window request log.

pub mod config;
pub mod error;
pub mod gateway;
pub mod quota;
pub mod store;
