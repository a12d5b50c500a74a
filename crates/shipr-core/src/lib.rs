pub mod clock;
pub mod config;
pub mod error;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ShiprError;
