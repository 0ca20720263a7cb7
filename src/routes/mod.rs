//! HTTP route handlers.

pub mod health;
pub mod notify;
pub mod sessions;
