//! SocketHub: a horizontally scalable publish/subscribe gateway
//!
//! Long-lived client connections subscribe to named channels and receive
//! messages published by any client or HTTP producer. Delivery is
//! at-least-once across reconnects and across worker processes sharing one
//! store, built on the store's append-only streams with per-session
//! consumer groups.

pub mod api;
mod app;
pub mod cluster;
pub mod core;
pub mod gateway;
pub mod store;

pub use app::CoreApp;
