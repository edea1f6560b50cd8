use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::revtun::{
    config::{ClientOptions, TunnelConfig},
    display::StatusSurface,
    net,
    status::{Console, status_bus},
    tunnel::{transport::Transport, worker::TunnelWorker},
};

/// Runs the console and one worker per configured tunnel.
pub struct ClientSupervisor {
    opts: ClientOptions,
    transport: Arc<dyn Transport>,
    surface: Box<dyn StatusSurface>,
}

impl ClientSupervisor {
    pub fn new(
        opts: ClientOptions,
        transport: Arc<dyn Transport>,
        surface: Box<dyn StatusSurface>,
    ) -> Self {
        Self {
            opts,
            transport,
            surface,
        }
    }

    /// Returns only once every worker has stopped. Workers run until the
    /// process exits, so in practice this means they all panicked.
    pub async fn run(self) -> anyhow::Result<BTreeMap<String, TunnelConfig>> {
        let ClientSupervisor {
            opts,
            transport,
            surface,
        } = self;

        tracing::info!(
            broker = %net::broker_authority(&opts.broker_host, opts.broker_port),
            transport = transport.name(),
            tunnels = opts.tunnels.len(),
            "revtun: starting"
        );

        let (status, rx) = status_bus();
        let mut workers = JoinSet::new();
        for cfg in opts.tunnels.values() {
            let worker = TunnelWorker::new(
                Arc::new(cfg.clone()),
                &opts,
                transport.clone(),
                status.clone(),
            );
            workers.spawn(worker.run());
        }
        drop(status);

        // The console becomes the only owner of the tunnel map.
        let console = Console::new(opts.tunnels, surface, opts.redraw_interval);
        let console = tokio::spawn(console.run(rx));

        while let Some(res) = workers.join_next().await {
            match res {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    tracing::error!(err = %err, "revtun: tunnel worker panicked");
                }
                Err(err) => {
                    tracing::debug!(err = %err, "revtun: tunnel worker cancelled");
                }
            }
        }

        console.await.context("status console task")
    }
}
