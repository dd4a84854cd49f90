use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::ledger::Selection;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Pipeline configuration file (YAML). Defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch per-book metadata records from the book page list.
    Metadata(MetadataArgs),
    /// Fold metadata records into the ledger.
    Consolidate(ConsolidateArgs),
    /// Download text and audio parts for selected ledger books.
    Download(DownloadArgs),
    /// Gate raw audio on sample rate and build one combined file per book.
    Qualify(QualifyArgs),
    /// Run metadata, consolidate, download and qualify in sequence.
    Harvest(HarvestArgs),
}

#[derive(Debug, Args)]
pub struct MetadataArgs {
    /// Book page list (default: `paths.url_list_path` from config).
    #[arg(long)]
    pub urls: Option<PathBuf>,

    /// Rebuild the ledger once all records are fetched.
    #[arg(long)]
    pub consolidate: bool,

    /// Maximum concurrent page fetches.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ConsolidateArgs {}

#[derive(Debug, Clone, Args)]
pub struct SelectionArgs {
    /// Select every book in the ledger.
    #[arg(long, conflicts_with_all = ["name", "author", "narrator"])]
    pub all: bool,

    /// Exact book title.
    #[arg(long)]
    pub name: Option<String>,

    /// Exact author name.
    #[arg(long)]
    pub author: Option<String>,

    /// Exact narrator name.
    #[arg(long)]
    pub narrator: Option<String>,
}

impl SelectionArgs {
    pub fn selection(&self) -> anyhow::Result<Selection> {
        if self.all {
            if self.name.is_some() || self.author.is_some() || self.narrator.is_some() {
                anyhow::bail!("--all cannot be combined with --name/--author/--narrator");
            }
            return Ok(Selection::All);
        }
        Selection::filter(
            self.name.clone(),
            self.author.clone(),
            self.narrator.clone(),
        )
    }
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub select: SelectionArgs,

    /// Maximum books downloaded at once.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl DownloadArgs {
    pub fn selection(&self) -> anyhow::Result<Selection> {
        self.select.selection()
    }
}

#[derive(Debug, Args)]
pub struct QualifyArgs {}

#[derive(Debug, Args)]
pub struct HarvestArgs {
    /// Fetch metadata even when a ledger already exists.
    #[arg(long)]
    pub refresh_metadata: bool,

    #[command(flatten)]
    pub select: SelectionArgs,
}
