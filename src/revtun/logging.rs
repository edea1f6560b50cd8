use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::revtun::config::LoggingConfig;

/// Keeps the non-blocking writer flushing; hold it for the process lifetime.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// The in-place status block owns the terminal. A log writer pointed at the
/// same TTY would scroll lines into it, so such output is discarded instead.
/// Returns whether the output was changed.
pub fn route_around_terminal(
    logging: &mut LoggingConfig,
    terminal_surface: bool,
    is_tty: impl Fn(&str) -> bool,
) -> bool {
    let out = logging.output.trim();
    let stream = match out {
        "" | "stderr" => "stderr",
        "stdout" => "stdout",
        _ => return false,
    };
    if !terminal_surface || !is_tty(stream) {
        return false;
    }
    logging.output = "discard".into();
    true
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "error" => "error",
        _ => "warn",
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_warn() {
        assert_eq!(level_directive(" DEBUG "), "debug");
        assert_eq!(level_directive("verbose"), "warn");
        assert_eq!(level_directive(""), "warn");
    }

    #[test]
    fn tty_logging_is_discarded_under_terminal_surface() {
        let mut cfg = LoggingConfig::default();
        assert!(route_around_terminal(&mut cfg, true, |s| s == "stderr"));
        assert_eq!(cfg.output, "discard");

        let mut cfg = LoggingConfig::default();
        assert!(!route_around_terminal(&mut cfg, false, |_| true));
        assert_eq!(cfg.output, "stderr");

        // stderr redirected to a file or pipe keeps logging.
        let mut cfg = LoggingConfig::default();
        assert!(!route_around_terminal(&mut cfg, true, |_| false));
        assert_eq!(cfg.output, "stderr");

        let mut cfg = LoggingConfig {
            output: "/var/log/revtun.log".into(),
            ..LoggingConfig::default()
        };
        assert!(!route_around_terminal(&mut cfg, true, |_| true));
        assert_eq!(cfg.output, "/var/log/revtun.log");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("revtun_log_test_{}", std::process::id()));
        let path = dir.join("logs").join("revtun.log");

        let (_writer, guard) = make_writer(path.to_str().unwrap()).unwrap();
        drop(guard);
        assert!(path.is_file());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
