pub mod api;
pub mod config;
pub mod debounce;
pub mod detector;
pub mod document;
pub mod filter;
pub mod observer;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod time;
