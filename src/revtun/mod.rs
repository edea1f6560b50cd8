pub mod app;
pub mod config;
pub mod display;
pub mod error;
pub mod logging;
pub mod net;
pub mod status;
pub mod supervisor;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>, plain: bool) -> anyhow::Result<()> {
    app::run(config_path, plain).await
}
