use std::{io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::revtun::{
    config::TunnelConfig,
    error::StreamError,
    net,
    status::{Banner, StatusSender, StreamPhase, TunnelStatus},
    tunnel::transport::IncomingStream,
};

/// Copy bytes both ways until either side closes or fails. Returns
/// `(stream -> local, local -> stream)` byte counts.
pub async fn relay<L, S>(local: &mut L, stream: &mut S) -> io::Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(stream, local).await
}

/// Carries one broker stream to the tunnel's local service.
#[derive(Clone)]
pub struct StreamRelay {
    cfg: Arc<TunnelConfig>,
    banner: Arc<Banner>,
    status: StatusSender,
}

impl StreamRelay {
    pub fn new(cfg: Arc<TunnelConfig>, banner: Arc<Banner>, status: StatusSender) -> Self {
        Self {
            cfg,
            banner,
            status,
        }
    }

    pub async fn run(self, mut stream: IncomingStream) {
        let target = net::local_target(self.cfg.local_port);
        self.emit(StreamPhase::Dialing).await;

        let mut local = match TcpStream::connect(target).await {
            Ok(c) => c,
            Err(source) => {
                let err = StreamError::Dial {
                    addr: target,
                    source,
                };
                tracing::debug!(tunnel = %self.cfg.name, stream = stream.id(), err = %err, "relay: local dial failed");
                stream.close().await;
                return;
            }
        };
        let _ = local.set_nodelay(true);

        self.emit(StreamPhase::Relaying).await;

        let res = match stream.mark_ready().await {
            Ok(()) => relay(&mut local, stream.io_mut()).await,
            Err(err) => Err(err),
        };

        let id = stream.id();
        let _ = local.shutdown().await;
        stream.close().await;

        match res {
            Ok((to_local, to_broker)) => {
                tracing::debug!(
                    tunnel = %self.cfg.name,
                    stream = id,
                    local = %target,
                    to_local,
                    to_broker,
                    "relay: stream done"
                );
                self.emit(StreamPhase::Idle).await;
            }
            Err(err) => {
                tracing::debug!(tunnel = %self.cfg.name, stream = id, err = %err, "relay: stream failed");
                self.emit(StreamPhase::Failed(StreamError::Relay(err))).await;
            }
        }
    }

    async fn emit(&self, phase: StreamPhase) {
        self.status
            .send(
                &self.cfg.name,
                TunnelStatus::Stream(self.banner.clone(), phase),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revtun::{
        status::{StatusUpdate, status_bus},
        tunnel::protocol,
    };
    use tokio::{io::AsyncReadExt, net::TcpListener, sync::mpsc};

    async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (c, _) = ln.accept().await.unwrap();
            let (mut r, mut w) = c.into_split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        (port, task)
    }

    fn setup(port: u16) -> (StreamRelay, mpsc::Receiver<StatusUpdate>, String) {
        let cfg = Arc::new(TunnelConfig::new("web", port));
        let banner = Arc::new(Banner {
            name: "web".into(),
            ack: "tcp://broker:9000".into(),
            target: net::local_target(port),
        });
        let prefix = TunnelStatus::Serving(banner.clone()).render("web", false);
        let (tx, rx) = status_bus();
        (StreamRelay::new(cfg, banner, tx), rx, prefix)
    }

    async fn next_text(rx: &mut mpsc::Receiver<StatusUpdate>) -> String {
        let u = rx.recv().await.unwrap();
        assert_eq!(u.tunnel, "web");
        u.status.render(&u.tunnel, false)
    }

    #[tokio::test]
    async fn relays_bytes_and_reports_phases() {
        let (port, echo) = echo_server().await;
        let (relay, mut rx, prefix) = setup(port);

        let (a, mut broker) = tokio::io::duplex(1024);
        let task = tokio::spawn(relay.run(IncomingStream::new(Box::new(a))));

        assert_eq!(next_text(&mut rx).await, format!("{prefix} ->"));
        assert_eq!(next_text(&mut rx).await, format!("{prefix} <->"));

        protocol::read_ready(&mut broker).await.unwrap();
        broker.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        broker.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
        broker.shutdown().await.unwrap();

        assert_eq!(next_text(&mut rx).await, prefix);
        task.await.unwrap();
        echo.await.unwrap();

        // Relay closed its end of the stream.
        let mut rest = Vec::new();
        broker.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn dial_failure_closes_stream_without_further_status() {
        let port = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap().port()
        };
        let (relay, mut rx, prefix) = setup(port);

        let (a, mut broker) = tokio::io::duplex(64);
        let task = tokio::spawn(relay.run(IncomingStream::new(Box::new(a))));

        assert_eq!(next_text(&mut rx).await, format!("{prefix} ->"));
        task.await.unwrap();

        let mut rest = Vec::new();
        broker.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no ready marker on dial failure");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broken_stream_reports_stream_err() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let local = tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            while c.write_all(b"hello").await.is_ok() {
                tokio::task::yield_now().await;
            }
        });
        let (relay, mut rx, prefix) = setup(port);

        let (a, mut broker) = tokio::io::duplex(64);
        let task = tokio::spawn(relay.run(IncomingStream::new(Box::new(a))));

        assert_eq!(next_text(&mut rx).await, format!("{prefix} ->"));
        assert_eq!(next_text(&mut rx).await, format!("{prefix} <->"));
        protocol::read_ready(&mut broker).await.unwrap();
        drop(broker);

        let last = next_text(&mut rx).await;
        assert!(
            last.starts_with(&format!("{prefix} stream err:")),
            "got {last:?}"
        );
        task.await.unwrap();
        local.await.unwrap();
    }

    #[tokio::test]
    async fn relay_counts_both_directions() {
        let (mut local, mut local_peer) = tokio::io::duplex(64);
        let (mut stream, mut broker) = tokio::io::duplex(64);

        let peer = tokio::spawn(async move {
            local_peer.write_all(b"abc").await.unwrap();
            local_peer.shutdown().await.unwrap();
            let mut got = Vec::new();
            local_peer.read_to_end(&mut got).await.unwrap();
            got
        });
        let far = tokio::spawn(async move {
            broker.write_all(b"hello").await.unwrap();
            broker.shutdown().await.unwrap();
            let mut got = Vec::new();
            broker.read_to_end(&mut got).await.unwrap();
            got
        });

        let (to_local, to_broker) = relay(&mut local, &mut stream).await.unwrap();
        drop((local, stream));
        assert_eq!((to_local, to_broker), (5, 3));
        assert_eq!(peer.await.unwrap(), b"hello");
        assert_eq!(far.await.unwrap(), b"abc");
    }
}
