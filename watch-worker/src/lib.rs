pub mod error;
pub mod queue;
pub mod sideload;
pub mod sink;
