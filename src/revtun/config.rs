use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::revtun::{display::DisplayMode, tunnel::protocol::TunnelBinding};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_REDRAW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap normally folds REVTUN_CONFIG into the flag; this covers callers
    // that construct the CLI without env support.
    if let Some(p) = std::env::var_os("REVTUN_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("revtun.toml")));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["revtun.toml", "revtun.yaml", "revtun.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no revtun.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/revtun/revtun.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "revtun", "revtun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("revtun.toml"))
    }
}

/// Write a commented template if nothing exists at `path`. Returns whether a
/// file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<ClientOptions> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = extension(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    ClientOptions::from_file_config(fc)
        .with_context(|| format!("config: {}", path.display()))
}

/// Process-wide settings, fixed after load.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub broker_host: String,
    pub broker_port: u16,
    pub auth_token: String,
    pub retry_delay: Duration,
    pub redraw_interval: Duration,
    pub display: DisplayMode,
    pub logging: LoggingConfig,
    pub tunnels: BTreeMap<String, TunnelConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// One configured tunnel. `status` holds the last rendered status line and is
/// only written by the console.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub local_port: u16,
    pub binding: TunnelBinding,
    pub status: Option<String>,
}

impl TunnelConfig {
    pub fn new(name: &str, local_port: u16) -> Self {
        Self {
            name: name.to_string(),
            local_port,
            binding: TunnelBinding {
                name: name.to_string(),
                protocol: "tcp".into(),
                remote_port: None,
                subdomain: None,
                hostname: None,
            },
            status: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    retry_delay_ms: Option<u64>,
    broker: Option<FileBroker>,
    display: Option<FileDisplay>,
    logging: Option<FileLogging>,
    #[serde(default)]
    tunnels: BTreeMap<String, FileTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBroker {
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDisplay {
    mode: Option<String>,
    redraw_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    #[serde(default)]
    local_port: u16,
    protocol: Option<String>,
    remote_port: Option<u16>,
    subdomain: Option<String>,
    hostname: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ClientOptions {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<ClientOptions> {
        // --- Broker ---
        let broker = fc.broker.context("missing [broker] section")?;
        let broker_host = broker.host.trim().to_string();
        if broker_host.is_empty() {
            anyhow::bail!("broker.host must not be empty");
        }
        if broker.port == 0 {
            anyhow::bail!("broker.port must be non-zero");
        }

        // --- Display ---
        let mut display = DisplayMode::Auto;
        let mut redraw_interval = DEFAULT_REDRAW_INTERVAL;
        if let Some(d) = &fc.display {
            if let Some(mode) = &d.mode {
                display = mode.parse()?;
            }
            if let Some(ms) = d.redraw_interval_ms {
                redraw_interval = Duration::from_millis(ms);
            }
        }

        // --- Logging ---
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                logging.output = out;
            }
            logging.add_source = l.add_source;
        }

        // --- Tunnels ---
        let mut tunnels = BTreeMap::new();
        for (raw_name, t) in fc.tunnels {
            if t.local_port == 0 {
                anyhow::bail!("tunnels.{raw_name}: local_port must be non-zero");
            }
            let binding = TunnelBinding {
                name: raw_name.clone(),
                protocol: t.protocol.unwrap_or_default(),
                remote_port: t.remote_port,
                subdomain: t.subdomain,
                hostname: t.hostname,
            }
            .normalize()
            .with_context(|| format!("tunnels.{raw_name:?}: empty tunnel name"))?;

            let name = binding.name.clone();
            let cfg = TunnelConfig {
                name: name.clone(),
                local_port: t.local_port,
                binding,
                status: None,
            };
            if tunnels.insert(name.clone(), cfg).is_some() {
                anyhow::bail!("tunnels: duplicate tunnel name {name:?}");
            }
        }
        if tunnels.is_empty() {
            anyhow::bail!("no tunnels configured (add a [tunnels.<name>] section)");
        }

        Ok(ClientOptions {
            broker_host,
            broker_port: broker.port,
            auth_token: broker.auth_token.unwrap_or_default().trim().to_string(),
            retry_delay: fc
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY),
            redraw_interval,
            display,
            logging,
            tunnels,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# revtun configuration (auto-generated)
#
# This file was created because revtun could not find a configuration file at
# the resolved config path. Point [broker] at your tunnel broker and add at
# least one [tunnels.<name>] section, then start revtun again.

# Wait between reconnect attempts after a tunnel's session fails.
retry_delay_ms = 3000

[broker]
host = "127.0.0.1"
port = 4100
auth_token = ""

[display]
mode = "auto" # auto | terminal | plain
redraw_interval_ms = 100

[logging]
level = "warn"
format = "text"
output = "stderr"
add_source = false

# [tunnels.web]
# local_port = 8080
# protocol = "tcp"
# remote_port = 8080
# subdomain = "web"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# revtun configuration (auto-generated)
#
# This file was created because revtun could not find a configuration file at
# the resolved config path. Point broker at your tunnel broker and add at
# least one entry under tunnels, then start revtun again.

retry_delay_ms: 3000

broker:
  host: "127.0.0.1"
  port: 4100
  auth_token: ""

display:
  mode: "auto" # auto | terminal | plain
  redraw_interval_ms: 100

logging:
  level: "warn"
  format: "text"
  output: "stderr"
  add_source: false

# tunnels:
#   web:
#     local_port: 8080
#     protocol: "tcp"
#     remote_port: 8080
#     subdomain: "web"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "revtun_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn loads_toml_with_defaults() {
        let dir = temp_dir("toml_defaults");
        let cfg_path = dir.join("revtun.toml");

        let toml = r#"
[broker]
host = " tunnel.example.com "
port = 4100
auth_token = "s3cret"

[tunnels.web]
local_port = 8080
remote_port = 9000
subdomain = " Web "

[tunnels.api]
local_port = 9090
protocol = "HTTP"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.broker_host, "tunnel.example.com");
        assert_eq!(cfg.broker_port, 4100);
        assert_eq!(cfg.auth_token, "s3cret");
        assert_eq!(cfg.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(cfg.redraw_interval, DEFAULT_REDRAW_INTERVAL);
        assert_eq!(cfg.display, DisplayMode::Auto);
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.logging.output, "stderr");

        let names: Vec<&str> = cfg.tunnels.keys().map(String::as_str).collect();
        assert_eq!(names, ["api", "web"]);

        let web = &cfg.tunnels["web"];
        assert_eq!(web.local_port, 8080);
        assert_eq!(web.binding.protocol, "tcp");
        assert_eq!(web.binding.remote_port, Some(9000));
        assert_eq!(web.binding.subdomain.as_deref(), Some("web"));
        assert!(web.status.is_none());
        assert_eq!(cfg.tunnels["api"].binding.protocol, "http");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_yaml_and_overrides() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("revtun.yaml");

        let yaml = r#"
retry_delay_ms: 500
broker:
  host: "::1"
  port: 7000
display:
  mode: plain
  redraw_interval_ms: 0
logging:
  level: debug
  format: json
tunnels:
  ssh:
    local_port: 22
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.retry_delay, Duration::from_millis(500));
        assert_eq!(cfg.redraw_interval, Duration::ZERO);
        assert_eq!(cfg.display, DisplayMode::Plain);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.auth_token, "");
        assert_eq!(cfg.tunnels["ssh"].local_port, 22);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_invalid_configs() {
        let dir = temp_dir("invalid");
        let cfg_path = dir.join("revtun.toml");

        let cases = [
            ("[broker]\nhost = \"\"\nport = 1\n[tunnels.a]\nlocal_port = 1\n", "broker.host"),
            ("[broker]\nhost = \"h\"\n[tunnels.a]\nlocal_port = 1\n", "broker.port"),
            ("[broker]\nhost = \"h\"\nport = 1\n", "no tunnels configured"),
            ("[broker]\nhost = \"h\"\nport = 1\n[tunnels.a]\nremote_port = 1\n", "local_port"),
            (
                "[broker]\nhost = \"h\"\nport = 1\n[tunnels.\"web\"]\nlocal_port = 1\n[tunnels.\" web\"]\nlocal_port = 2\n",
                "duplicate",
            ),
            (
                "[broker]\nhost = \"h\"\nport = 1\n[tunnels.\"  \"]\nlocal_port = 1\n",
                "empty tunnel name",
            ),
            ("admin_addr = \":8080\"\n", "unknown field"),
            (
                "[broker]\nhost = \"h\"\nport = 1\n[logging]\nlevle = \"debug\"\n[tunnels.a]\nlocal_port = 1\n",
                "unknown field",
            ),
        ];
        for (body, want) in cases {
            std::fs::write(&cfg_path, body).expect("write");
            let err = load_config(&cfg_path).unwrap_err();
            let s = format!("{err:#}");
            assert!(s.contains(want), "want {want:?} in {s:?}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ensure_config_file_writes_template_once() {
        let dir = temp_dir("ensure");
        let cfg_path = dir.join("nested").join("revtun.toml");

        assert!(ensure_config_file(&cfg_path).unwrap());
        assert!(!ensure_config_file(&cfg_path).unwrap());

        // The template parses but has no tunnels yet.
        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("no tunnels configured"));

        let yaml_path = dir.join("revtun.yml");
        assert!(ensure_config_file(&yaml_path).unwrap());
        let err = load_config(&yaml_path).unwrap_err();
        assert!(format!("{err:#}").contains("no tunnels configured"));

        assert!(ensure_config_file(&dir.join("revtun.ini")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_path_resolution() {
        let dir = temp_dir("explicit");

        let p = normalize_explicit_path(&dir.join("custom")).unwrap();
        assert_eq!(p, dir.join("custom.toml"));

        let p = normalize_explicit_path(&dir).unwrap();
        assert_eq!(p, dir.join("revtun.toml"));

        std::fs::write(dir.join("revtun.yaml"), "").expect("write");
        let p = normalize_explicit_path(&dir).unwrap();
        assert_eq!(p, dir.join("revtun.yaml"));

        let r = resolve_config_path(Some(dir.join("x.yml"))).unwrap();
        assert_eq!(r.source, ConfigPathSource::Flag);
        assert_eq!(r.path, dir.join("x.yml"));

        assert!(normalize_explicit_path(Path::new("")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
