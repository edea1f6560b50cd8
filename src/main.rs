mod revtun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "revtun",
    version,
    about = "revtun - expose local TCP services through a remote tunnel broker"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses REVTUN_CONFIG; then auto-detects revtun.toml > revtun.yaml > revtun.yml from CWD; then falls back to the OS default path (Linux: /etc/revtun/revtun.toml; others: user config dir).
    #[arg(long, env = "REVTUN_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Print one line per status change instead of redrawing the tunnel list.
    #[arg(long)]
    plain: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    revtun::run(cli.config, cli.plain).await
}
