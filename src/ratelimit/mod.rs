//! Rate limit accounting over the counter tiers.

mod backend;
mod segment;
mod service;

pub use backend::RateLimiterBackend;
pub use segment::Segment;
pub use service::RateLimitService;
