//! Domain types, persistence and the shared state every task touches.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod hash;
pub mod store;
pub mod time;
pub mod types;
