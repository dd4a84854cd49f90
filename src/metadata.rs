use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::cli::{ConsolidateArgs, MetadataArgs};
use crate::config::PipelineConfig;
use crate::extract::{HtmlMetadataExtractor, MetadataExtractor};
use crate::formats::{Book, BookPages, book_slug, record_file_name};
use crate::ledger::Ledger;
use crate::pool::{BoundedTaskPool, ProgressLog, TaskOutcome};

#[derive(Debug)]
pub enum MetadataOutcome {
    Saved(PathBuf),
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataSummary {
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_started: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationSummary {
    pub records: usize,
    pub rows: usize,
    pub filtered: usize,
    pub corrupt: usize,
    /// Rows whose qualification results came from the previous ledger.
    pub carried: usize,
}

pub async fn run(
    args: MetadataArgs,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut config = config.clone();
    if let Some(concurrency) = args.concurrency {
        config.limits.metadata_fetch_limit = concurrency.max(1);
    }

    let urls_path = args
        .urls
        .clone()
        .unwrap_or_else(|| config.paths.url_list_path.clone());
    let pages = read_page_list(&urls_path, config.http.text_base_url.as_deref())
        .with_context(|| format!("read page list: {}", urls_path.display()))?;
    tracing::info!(books = pages.len(), list = %urls_path.display(), "metadata: page list loaded");

    let extractor: Arc<dyn MetadataExtractor> =
        Arc::new(HtmlMetadataExtractor::from_config(&config.http)?);
    let summary = fetch_all(
        pages,
        extractor,
        &config.paths.metadata_dir,
        config.limits.metadata_fetch_limit,
        cancel.clone(),
    )
    .await?;
    tracing::info!(
        saved = summary.saved,
        skipped = summary.skipped,
        failed = summary.failed,
        not_started = summary.not_started,
        "metadata: done"
    );

    if cancel.is_cancelled() {
        anyhow::bail!("metadata fetch interrupted");
    }

    if args.consolidate {
        consolidate_blocking(&config).await?;
    }
    Ok(())
}

pub async fn run_consolidate(_args: ConsolidateArgs, config: &PipelineConfig) -> anyhow::Result<()> {
    consolidate_blocking(config).await.map(|_| ())
}

pub(crate) async fn consolidate_blocking(
    config: &PipelineConfig,
) -> anyhow::Result<ConsolidationSummary> {
    let metadata_dir = config.paths.metadata_dir.clone();
    let ledger_path = config.paths.ledger_path.clone();
    let summary = tokio::task::spawn_blocking(move || consolidate(&metadata_dir, &ledger_path))
        .await
        .context("spawn_blocking join")??;
    tracing::info!(
        records = summary.records,
        rows = summary.rows,
        filtered = summary.filtered,
        corrupt = summary.corrupt,
        carried = summary.carried,
        ledger = %config.paths.ledger_path.display(),
        "consolidate: ledger written"
    );
    Ok(summary)
}

/// Extracts and persists one record per page pair, at most `cap` at a time.
pub async fn fetch_all(
    pages: Vec<BookPages>,
    extractor: Arc<dyn MetadataExtractor>,
    metadata_dir: &Path,
    cap: usize,
    cancel: CancellationToken,
) -> anyhow::Result<MetadataSummary> {
    tokio::fs::create_dir_all(metadata_dir)
        .await
        .with_context(|| format!("create metadata dir: {}", metadata_dir.display()))?;

    let limit = cap.min(pages.len()).max(1);
    let mut pool = BoundedTaskPool::new(limit, cancel);
    for pages in pages {
        let extractor = Arc::clone(&extractor);
        let metadata_dir = metadata_dir.to_path_buf();
        pool.submit(move |_| async move { fetch_one(extractor.as_ref(), &pages, &metadata_dir).await });
    }

    let mut summary = MetadataSummary::default();
    let mut progress = ProgressLog::new("metadata");
    while let Some(outcome) = pool.next().await {
        match outcome {
            TaskOutcome::Finished(MetadataOutcome::Saved(path)) => {
                tracing::debug!(path = %path.display(), "metadata record saved");
                summary.saved += 1;
            }
            TaskOutcome::Finished(MetadataOutcome::Skipped) => summary.skipped += 1,
            TaskOutcome::Finished(MetadataOutcome::Failed(reason)) => {
                tracing::warn!(%reason, "metadata extraction failed");
                summary.failed += 1;
            }
            TaskOutcome::NotStarted => summary.not_started += 1,
            TaskOutcome::Panicked(reason) => {
                tracing::error!(%reason, "metadata task panicked");
                summary.failed += 1;
            }
        }
        progress.observe(pool.progress(), summary.failed);
    }

    Ok(summary)
}

async fn fetch_one(
    extractor: &dyn MetadataExtractor,
    pages: &BookPages,
    metadata_dir: &Path,
) -> MetadataOutcome {
    let book = match extractor.extract(pages).await {
        Ok(Some(book)) => book,
        Ok(None) => {
            tracing::info!(text_page = %pages.text_page_url, "no metadata record produced");
            return MetadataOutcome::Skipped;
        }
        Err(err) => return MetadataOutcome::Failed(format!("{}: {err:#}", pages.text_page_url)),
    };

    let path = metadata_dir.join(record_file_name(&pages.text_page_url));
    match write_record(&path, &book).await {
        Ok(()) => MetadataOutcome::Saved(path),
        Err(err) => MetadataOutcome::Failed(format!("{err:#}")),
    }
}

async fn write_record(path: &Path, book: &Book) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(book).context("serialize book record")?;
    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

/// Reads every `*.json` record under `metadata_dir` and writes the ledger.
/// Corrupt records are skipped. Rows already in an existing ledger keep their
/// qualification results and statistics.
pub fn consolidate(metadata_dir: &Path, ledger_path: &Path) -> anyhow::Result<ConsolidationSummary> {
    std::fs::create_dir_all(metadata_dir)
        .with_context(|| format!("create metadata dir: {}", metadata_dir.display()))?;

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(metadata_dir)
        .with_context(|| format!("read metadata dir: {}", metadata_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut summary = ConsolidationSummary::default();
    let mut books = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = std::fs::read(&path)
            .with_context(|| format!("read metadata record: {}", path.display()))
            .and_then(|bytes| serde_json::from_slice::<Book>(&bytes).context("parse json"));
        match parsed {
            Ok(book) => books.push(book),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skip corrupt metadata record");
                summary.corrupt += 1;
            }
        }
    }
    summary.records = books.len();

    let (mut ledger, stats) = Ledger::from_books(books);
    summary.rows = stats.rows;
    summary.filtered = stats.filtered;

    if ledger_path.exists() {
        match Ledger::load(ledger_path) {
            Ok(previous) => summary.carried = ledger.carry_over(&previous),
            Err(err) => {
                tracing::warn!(ledger = %ledger_path.display(), error = %format!("{err:#}"), "previous ledger unreadable; rebuilding without it");
            }
        }
    }

    if ledger.is_empty() {
        tracing::info!(dir = %metadata_dir.display(), "no metadata records were consolidated");
    }
    ledger.save_atomic(ledger_path).context("save ledger")?;
    Ok(summary)
}

/// Colon-separated base-60 components, most significant first.
pub fn parse_duration_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.split(':').try_fold(0_u64, |acc, part| {
        let value = part.trim().parse::<u64>().ok()?;
        acc.checked_mul(60)?.checked_add(value)
    })
}

pub fn duration_hours(raw: &str) -> Option<f64> {
    let secs = parse_duration_secs(raw)?;
    Some((secs as f64 / 3600.0 * 10_000.0).round() / 10_000.0)
}

/// One book per line: `text_url<TAB>audio_url`, or a bare audio-page URL
/// whose text page is `text_base_url` + its slug.
pub fn read_page_list(path: &Path, text_base_url: Option<&str>) -> anyhow::Result<Vec<BookPages>> {
    let contents = std::fs::read_to_string(path)?;
    let mut pages = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((text, audio)) = line.split_once('\t') {
            pages.push(BookPages {
                text_page_url: text.trim().to_owned(),
                audio_page_url: audio.trim().to_owned(),
            });
            continue;
        }
        let Some(base) = text_base_url else {
            anyhow::bail!(
                "line {}: bare audio URL needs http.text_base_url to derive the text page",
                idx + 1
            );
        };
        pages.push(BookPages {
            text_page_url: format!("{base}{}", book_slug(line)),
            audio_page_url: line.to_owned(),
        });
    }
    Ok(pages)
}
