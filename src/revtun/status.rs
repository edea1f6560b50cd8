//! Status reporting.
//!
//! Every worker and every stream relay reports progress by sending a
//! [`StatusUpdate`] over the status bus. A single [`Console`] task owns the
//! tunnel map, applies each update to it and redraws the display surface.
//! Nothing else writes a tunnel's status or touches the display.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use crossterm::style::{Color, Stylize};
use tokio::sync::mpsc;

use crate::revtun::{
    config::TunnelConfig,
    display::{StatusSurface, StatusView},
    error::{SessionError, StreamError},
};

/// Shown for tunnels that have not reported anything yet.
pub const PLACEHOLDER: &str = "start";

/// Success line of a registered tunnel. Stream statuses are built on top of
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub name: String,
    pub ack: String,
    pub target: SocketAddr,
}

impl Banner {
    fn render(&self, ansi: bool) -> String {
        format!(
            "{:<10} tunnel {}, {} =>tcp://{}",
            self.name,
            paint("ok", Color::Green, ansi),
            self.ack,
            self.target
        )
    }
}

#[derive(Debug)]
pub enum StreamPhase {
    /// Dialing the local service.
    Dialing,
    /// Local side connected, bytes flowing.
    Relaying,
    /// Relay finished cleanly.
    Idle,
    Failed(StreamError),
}

#[derive(Debug)]
pub enum TunnelStatus {
    Connecting,
    Serving(Arc<Banner>),
    Terminated(SessionError),
    Stream(Arc<Banner>, StreamPhase),
}

impl TunnelStatus {
    pub fn render(&self, tunnel: &str, ansi: bool) -> String {
        match self {
            TunnelStatus::Connecting => format!("connecting tunnel:{tunnel}"),
            TunnelStatus::Serving(b) => b.render(ansi),
            TunnelStatus::Terminated(err) => format!(
                "{}: {}",
                err.label(),
                paint(&format!("{:#}", err.cause()), Color::Red, ansi)
            ),
            TunnelStatus::Stream(b, phase) => {
                let b = b.render(ansi);
                match phase {
                    StreamPhase::Dialing => format!("{b} {}", paint("->", Color::Green, ansi)),
                    StreamPhase::Relaying => format!("{b} {}", paint("<->", Color::Green, ansi)),
                    StreamPhase::Idle => b,
                    StreamPhase::Failed(err) => {
                        format!("{b} stream err:{}", paint(&err.to_string(), Color::Red, ansi))
                    }
                }
            }
        }
    }
}

fn paint(s: &str, color: Color, ansi: bool) -> String {
    if ansi {
        s.with(color).to_string()
    } else {
        s.to_string()
    }
}

#[derive(Debug)]
pub struct StatusUpdate {
    pub tunnel: String,
    pub status: TunnelStatus,
}

/// Producer handle for the status bus. Cheap to clone; one per task.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusSender {
    /// Waits until the console has room for the update.
    pub async fn send(&self, tunnel: &str, status: TunnelStatus) {
        let update = StatusUpdate {
            tunnel: tunnel.to_string(),
            status,
        };
        if self.tx.send(update).await.is_err() {
            tracing::debug!(tunnel = %tunnel, "status: console gone; update dropped");
        }
    }
}

/// Create the status bus. Capacity 1 keeps producers in lockstep with the
/// console.
pub fn status_bus() -> (StatusSender, mpsc::Receiver<StatusUpdate>) {
    let (tx, rx) = mpsc::channel(1);
    (StatusSender { tx }, rx)
}

/// Sole owner of the tunnel map and the display.
pub struct Console {
    tunnels: BTreeMap<String, TunnelConfig>,
    surface: Box<dyn StatusSurface>,
    redraw_interval: Duration,
}

impl Console {
    pub fn new(
        tunnels: BTreeMap<String, TunnelConfig>,
        surface: Box<dyn StatusSurface>,
        redraw_interval: Duration,
    ) -> Self {
        Self {
            tunnels,
            surface,
            redraw_interval,
        }
    }

    /// Drain the bus until every sender is gone, then hand the map back.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<StatusUpdate>,
    ) -> BTreeMap<String, TunnelConfig> {
        while let Some(update) = rx.recv().await {
            let Some(idx) = self.apply(update) else {
                continue;
            };
            self.redraw(idx);
            if !self.redraw_interval.is_zero() {
                tokio::time::sleep(self.redraw_interval).await;
            }
        }
        self.tunnels
    }

    /// Store the rendered status; returns the tunnel's row index.
    fn apply(&mut self, update: StatusUpdate) -> Option<usize> {
        let ansi = self.surface.ansi();
        let idx = self.tunnels.keys().position(|k| *k == update.tunnel);
        let (Some(idx), Some(cfg)) = (idx, self.tunnels.get_mut(&update.tunnel)) else {
            tracing::warn!(tunnel = %update.tunnel, "status: update for unknown tunnel");
            return None;
        };

        let text = update.status.render(&cfg.name, ansi);
        tracing::debug!(tunnel = %cfg.name, status = %update.status.render(&cfg.name, false), "status");
        cfg.status = Some(text);
        Some(idx)
    }

    fn redraw(&mut self, changed: usize) {
        let view = StatusView {
            rows: self
                .tunnels
                .values()
                .map(|t| (t.name.as_str(), t.status.as_deref().unwrap_or(PLACEHOLDER)))
                .collect(),
            changed: Some(changed),
        };
        if let Err(err) = self.surface.render(&view) {
            tracing::warn!(err = %err, "status: display write failed");
        }
    }
}
