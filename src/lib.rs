pub mod cli;
pub mod db;
pub mod history;
pub mod insights;
pub mod monitor;
pub mod readings;
pub mod session;
pub mod settings;
pub mod source;
pub mod utils;

use clap::Parser;

use settings::{Settings, SettingsStore};

pub async fn run() -> anyhow::Result<()> {
    // Reads RUST_LOG; defaults to info.
    utils::logging::init();

    let cli = cli::Cli::parse();

    let settings = SettingsStore::new(Settings::default_path());
    log::info!("airwatch starting (settings: {})", settings.path().display());

    cli::execute(cli.command, &settings).await
}
