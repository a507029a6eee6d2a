//! HTTP transport for the rate limit accounting API.

mod handler;
mod server;

pub use handler::{configure, enforce_json, ApiError, QuotaDecision};
pub use server::ApiServer;
