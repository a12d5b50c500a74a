pub mod collector;
pub mod engine;
pub mod identity;
pub mod progress;
pub mod strategy;

pub use collector::{Collector, PullRequestCounts};
pub use engine::SyncEngine;
pub use identity::IdentityResolver;
pub use progress::{Outcome, ProgressObserver, ProgressTracker};
pub use strategy::Strategy;
