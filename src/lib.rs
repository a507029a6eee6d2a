//! ARL - API Rate Limit accounting service
//!
//! Records events per key and answers whether a key's quota has been
//! exceeded in the current second or hour. Counts live in two tiers: an
//! in-process fast counter with background eviction, and a Redis-backed
//! durable counter shared across restarts and instances.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
