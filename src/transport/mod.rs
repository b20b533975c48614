//! Transport module - TCP socket handling.
//!
//! Provides:
//! - [`Target`] addressing (`host:port`, bare port, `SocketAddr`)
//! - dialing with `TCP_NODELAY` and binding listeners

mod tcp;

pub use tcp::{bind, connect, Target, DEFAULT_HOST};
