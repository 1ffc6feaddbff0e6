pub mod event;
pub mod health;
pub mod metrics;
pub mod retry;
