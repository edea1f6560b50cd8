use std::{convert::Infallible, sync::Arc, time::Duration};

use crate::revtun::{
    config::{ClientOptions, TunnelConfig},
    error::SessionError,
    net,
    status::{Banner, StatusSender, TunnelStatus},
    tunnel::{
        relay::StreamRelay,
        transport::{Transport, TunnelSession},
    },
};

/// Keeps one tunnel registered with the broker.
///
/// Each pass connects, authenticates, registers and then serves broker
/// streams until the session fails. The session is closed, the failure is
/// reported and the worker waits `retry_delay` before starting over. There is
/// no retry limit; the worker only stops with the process.
pub struct TunnelWorker {
    cfg: Arc<TunnelConfig>,
    broker_host: String,
    broker_port: u16,
    auth_token: String,
    transport: Arc<dyn Transport>,
    status: StatusSender,
    retry_delay: Duration,
}

impl TunnelWorker {
    pub fn new(
        cfg: Arc<TunnelConfig>,
        opts: &ClientOptions,
        transport: Arc<dyn Transport>,
        status: StatusSender,
    ) -> Self {
        Self {
            cfg,
            broker_host: opts.broker_host.clone(),
            broker_port: opts.broker_port,
            auth_token: opts.auth_token.clone(),
            transport,
            status,
            retry_delay: opts.retry_delay,
        }
    }

    pub async fn run(self) {
        loop {
            self.emit(TunnelStatus::Connecting).await;

            let err = self.run_once().await;
            // Status line already shows the error; keep this below the default level.
            tracing::info!(
                tunnel = %self.cfg.name,
                broker = %net::broker_authority(&self.broker_host, self.broker_port),
                transport = self.transport.name(),
                err = %err,
                retry_in = %humantime::format_duration(self.retry_delay),
                "tunnel: session ended; retrying"
            );
            self.emit(TunnelStatus::Terminated(err)).await;

            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// One connect-to-failure pass. The session is closed before returning.
    async fn run_once(&self) -> SessionError {
        let mut sess = match self
            .transport
            .connect(&self.broker_host, self.broker_port)
            .await
        {
            Ok(s) => s,
            Err(err) => return SessionError::Connect(err),
        };

        let Err(err) = self.serve(sess.as_mut()).await;
        sess.close().await;
        err
    }

    async fn serve(&self, sess: &mut dyn TunnelSession) -> Result<Infallible, SessionError> {
        let welcome = sess
            .authenticate(&self.auth_token)
            .await
            .map_err(SessionError::Auth)?;
        tracing::debug!(tunnel = %self.cfg.name, welcome = %welcome, "tunnel: authenticated");

        let ack = sess
            .register_tunnel(&self.cfg.binding)
            .await
            .map_err(SessionError::Register)?;

        let banner = Arc::new(Banner {
            name: self.cfg.name.clone(),
            ack,
            target: net::local_target(self.cfg.local_port),
        });
        tracing::info!(
            tunnel = %self.cfg.name,
            remote = ?sess.remote_addr(),
            ack = %banner.ack,
            local = %banner.target,
            "tunnel: registered"
        );
        self.emit(TunnelStatus::Serving(banner.clone())).await;

        let relay = StreamRelay::new(self.cfg.clone(), banner, self.status.clone());
        loop {
            let st = sess.accept_stream().await.map_err(SessionError::Accept)?;
            tracing::debug!(tunnel = %self.cfg.name, stream = st.id(), "tunnel: stream accepted");
            tokio::spawn(relay.clone().run(st));
        }
    }

    async fn emit(&self, status: TunnelStatus) {
        self.status.send(&self.cfg.name, status).await;
    }
}
