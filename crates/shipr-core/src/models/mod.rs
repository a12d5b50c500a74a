pub mod activity;
pub mod metrics;
pub mod repository;
pub mod sync_state;
pub mod team;
pub mod user;
