use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::cli::{HarvestArgs, MetadataArgs, QualifyArgs};
use crate::config::PipelineConfig;
use crate::ledger::Selection;

/// Runs every stage in order, stopping at the first failed stage. Without
/// filters every ledger book is selected.
pub async fn run(
    args: HarvestArgs,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let select = &args.select;
    let selection = if select.name.is_none() && select.author.is_none() && select.narrator.is_none() {
        Selection::All
    } else {
        select.selection()?
    };
    let ledger_path = &config.paths.ledger_path;

    if args.refresh_metadata || !ledger_path.exists() {
        tracing::info!(refresh = args.refresh_metadata, "harvest: metadata");
        crate::metadata::run(
            MetadataArgs {
                urls: None,
                consolidate: false,
                concurrency: None,
            },
            config,
            cancel.clone(),
        )
        .await
        .context("metadata")?;
    } else {
        tracing::info!(ledger = %ledger_path.display(), "harvest: ledger present; skipping metadata");
    }

    tracing::info!("harvest: consolidate");
    crate::metadata::consolidate_blocking(config)
        .await
        .context("consolidate")?;

    tracing::info!(?selection, "harvest: download");
    crate::download::download_selection(
        &selection,
        config.limits.download_book_limit,
        config,
        cancel.clone(),
    )
    .await
    .context("download")?;

    if cancel.is_cancelled() {
        anyhow::bail!("harvest interrupted");
    }

    tracing::info!("harvest: qualify");
    crate::audio::run(QualifyArgs {}, config)
        .await
        .context("qualify")?;

    Ok(())
}
