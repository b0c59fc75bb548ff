//! Front-door gateway enforcing a shared per-client request quota and a bound
//! on requests in flight to the backend, then proxying what it admits.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod store;
