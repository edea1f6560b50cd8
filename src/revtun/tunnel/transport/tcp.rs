use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{net::TcpStream, sync::mpsc};

use crate::revtun::{
    net,
    tunnel::{
        protocol::{self, TunnelBinding},
        transport::{BoxedStream, IncomingStream, Transport, TunnelSession},
    },
};

#[derive(Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Box<dyn TunnelSession>> {
        let host = net::normalize_host(host);
        let c = TcpStream::connect((host.as_ref(), port))
            .await
            .with_context(|| format!("dial {}", net::broker_authority(&host, port)))?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(YamuxSession::client(c)))
    }
}

/// Client end of a yamux session. The first stream the client opens is the
/// control stream; every stream the broker opens is a relay stream.
struct YamuxSession {
    control: tokio_yamux::Control,
    ctrl_stream: Option<BoxedStream>,
    incoming: mpsc::Receiver<tokio_yamux::StreamHandle>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    fn client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let mut session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "tunnel: yamux session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control,
            ctrl_stream: None,
            incoming: rx,
            remote,
            task,
        }
    }

    fn ctrl(&mut self) -> anyhow::Result<&mut BoxedStream> {
        self.ctrl_stream
            .as_mut()
            .context("tunnel: control stream not open (authenticate first)")
    }
}

#[async_trait]
impl TunnelSession for YamuxSession {
    async fn authenticate(&mut self, token: &str) -> anyhow::Result<String> {
        let st = self
            .control
            .open_stream()
            .await
            .context("open control stream")?;
        let ctrl = self.ctrl_stream.insert(Box::new(st));

        protocol::write_auth_request(ctrl, token).await?;
        Ok(protocol::read_reply(ctrl).await?)
    }

    async fn register_tunnel(&mut self, binding: &TunnelBinding) -> anyhow::Result<String> {
        let ctrl = self.ctrl()?;
        protocol::write_register_request(ctrl, binding).await?;
        Ok(protocol::read_reply(ctrl).await?)
    }

    async fn accept_stream(&mut self) -> anyhow::Result<IncomingStream> {
        let st = self
            .incoming
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(IncomingStream::new(Box::new(st)))
    }

    async fn close(&mut self) {
        self.ctrl_stream = None;
        self.task.abort();
        self.control.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
