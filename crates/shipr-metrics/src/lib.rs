pub mod aggregate;
pub mod cache;
pub mod engine;
pub mod synthetic;

pub use cache::{CacheKey, MetricsCache};
pub use engine::{MetricsEngine, MetricsRequest};
