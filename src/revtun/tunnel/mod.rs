//! Client side of the reverse tunnel.
//!
//! Each configured tunnel gets a [`worker::TunnelWorker`] that keeps a broker
//! session registered and hands every stream the broker pushes to a
//! [`relay::StreamRelay`]. The wire format lives in [`protocol`]; broker
//! connections come from a [`transport::Transport`].

pub mod protocol;
pub mod relay;
pub mod transport;
pub mod worker;
