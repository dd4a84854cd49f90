use std::process::ExitCode;

use anyhow::Context as _;
use audiobook_harvest::cli::{Cli, Command};
use audiobook_harvest::config::PipelineConfig;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    audiobook_harvest::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = PipelineConfig::load(cli.config.as_deref()).context("load config")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            shutdown.cancel();
        }
    });

    match cli.command {
        Command::Metadata(args) => {
            audiobook_harvest::metadata::run(args, &config, cancel)
                .await
                .context("metadata")?;
        }
        Command::Consolidate(args) => {
            audiobook_harvest::metadata::run_consolidate(args, &config)
                .await
                .context("consolidate")?;
        }
        Command::Download(args) => {
            audiobook_harvest::download::run(args, &config, cancel)
                .await
                .context("download")?;
        }
        Command::Qualify(args) => {
            audiobook_harvest::audio::run(args, &config)
                .await
                .context("qualify")?;
        }
        Command::Harvest(args) => {
            audiobook_harvest::harvest::run(args, &config, cancel)
                .await
                .context("harvest")?;
        }
    }

    Ok(())
}
