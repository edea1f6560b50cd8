use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::revtun::tunnel::protocol::{self, ProtocolError, TunnelBinding};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Opens sessions to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Box<dyn TunnelSession>>;
}

/// One live connection to the broker. Owned by exactly one worker and
/// discarded after the first error.
#[async_trait]
pub trait TunnelSession: Send {
    /// Returns the broker's acknowledgment text.
    async fn authenticate(&mut self, token: &str) -> anyhow::Result<String>;
    /// Returns the broker's description of what it bound for this tunnel.
    async fn register_tunnel(&mut self, binding: &TunnelBinding) -> anyhow::Result<String>;
    /// Waits for the broker to push the next stream.
    async fn accept_stream(&mut self) -> anyhow::Result<IncomingStream>;
    async fn close(&mut self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A stream pushed by the broker, not yet carrying traffic until
/// [`IncomingStream::mark_ready`] is sent.
pub struct IncomingStream {
    id: u64,
    io: BoxedStream,
}

impl IncomingStream {
    pub fn new(io: BoxedStream) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(1);
        Self {
            id: SEQ.fetch_add(1, Ordering::Relaxed),
            io,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tell the broker the local side is connected and bytes may flow.
    pub async fn mark_ready(&mut self) -> io::Result<()> {
        protocol::write_ready(&mut self.io)
            .await
            .map_err(|err| match err {
                ProtocolError::Io(err) => err,
                other => io::Error::other(other),
            })
    }

    pub fn io_mut(&mut self) -> &mut BoxedStream {
        &mut self.io
    }

    pub async fn close(mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub mod tcp;
