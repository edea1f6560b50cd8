use std::{io, path::PathBuf, sync::Arc};

use anyhow::Context;
use crossterm::tty::IsTty;

use crate::revtun::{
    config,
    display::{self, DisplayMode},
    logging,
    supervisor::ClientSupervisor,
    tunnel::transport::tcp::TcpTransport,
};

pub async fn run(config_path: Option<PathBuf>, plain: bool) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut opts = config::load_config(&resolved.path).with_context(|| {
        if created {
            format!(
                "created config template at {} ({}); add a tunnel and restart",
                resolved.path.display(),
                resolved.source
            )
        } else {
            format!("load config: {}", resolved.path.display())
        }
    })?;

    let mode = if plain { DisplayMode::Plain } else { opts.display };
    let terminal = display::uses_terminal(mode);
    logging::route_around_terminal(&mut opts.logging, terminal, |stream| {
        match stream {
            "stdout" => io::stdout().is_tty(),
            _ => io::stderr().is_tty(),
        }
    });

    let logrt = logging::init(&opts.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        tunnels = opts.tunnels.len(),
        "revtun: config loaded"
    );

    let transport = Arc::new(TcpTransport::new());
    let surface = display::surface_for(mode);

    let supervisor = ClientSupervisor::new(opts, transport, surface);

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = supervisor.run() => {
            res?;
            anyhow::bail!("revtun: every tunnel worker stopped");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
