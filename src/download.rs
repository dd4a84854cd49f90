use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::cli::DownloadArgs;
use crate::config::PipelineConfig;
use crate::extract::{HtmlMetadataExtractor, MetadataExtractor};
use crate::fetch::{AssetFetcher, HttpAssetFetcher};
use crate::formats::{Book, url_extension};
use crate::ledger::{Ledger, Selection};
use crate::pool::{BoundedTaskPool, ProgressLog, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Pending,
    ResolvingLinks,
    Fetching,
    Verified,
    PartiallyFailed,
    CancelledAndCleaned,
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::ResolvingLinks => "resolving-links",
            Self::Fetching => "fetching",
            Self::Verified => "verified",
            Self::PartiallyFailed => "partially-failed",
            Self::CancelledAndCleaned => "cancelled-and-cleaned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookOutcome {
    Verified { files: usize },
    PartiallyFailed { failed: usize, total: usize },
    CancelledAndCleaned,
    Failed { reason: String },
}

impl BookOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub verified: usize,
    pub partially_failed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Where a book's artifacts land: `<text_dir>/<slug>.<ext>` and
/// `<audio_raw_dir>/<slug>/<slug>_<n>.<ext>`.
#[derive(Debug, Clone)]
pub struct DownloadLayout {
    pub text_dir: PathBuf,
    pub audio_raw_dir: PathBuf,
}

impl DownloadLayout {
    pub fn book_audio_dir(&self, slug: &str) -> PathBuf {
        self.audio_raw_dir.join(slug)
    }

    pub fn part_path(&self, slug: &str, index: usize, url: &str) -> PathBuf {
        let ext = url_extension(url).unwrap_or_else(|| "mp3".to_owned());
        self.book_audio_dir(slug).join(format!("{slug}_{index}.{ext}"))
    }

    pub fn text_path(&self, slug: &str, url: &str) -> PathBuf {
        match url_extension(url) {
            Some(ext) => self.text_dir.join(format!("{slug}.{ext}")),
            None => self.text_dir.join(slug),
        }
    }
}

pub async fn run(
    args: DownloadArgs,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let selection = args.selection()?;
    let concurrency = args
        .concurrency
        .unwrap_or(config.limits.download_book_limit);
    download_selection(&selection, concurrency, config, cancel).await
}

pub(crate) async fn download_selection(
    selection: &Selection,
    concurrency: usize,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ledger_path = config.paths.ledger_path.clone();
    let ledger = tokio::task::spawn_blocking(move || Ledger::load(&ledger_path))
        .await
        .context("spawn_blocking join")?
        .context("load ledger")?;
    let books: Vec<Book> = ledger
        .select(selection)
        .into_iter()
        .map(|row| row.book.clone())
        .collect();
    tracing::info!(selected = books.len(), ?selection, "download: books selected");

    let fetcher: Arc<dyn AssetFetcher> = Arc::new(HttpAssetFetcher::from_config(&config.http)?);
    let resolver: Arc<dyn MetadataExtractor> =
        Arc::new(HtmlMetadataExtractor::from_config(&config.http)?);
    let layout = DownloadLayout {
        text_dir: config.paths.text_dir.clone(),
        audio_raw_dir: config.paths.audio_raw_dir.clone(),
    };

    let summary =
        download_books(books, fetcher, resolver, layout, concurrency, cancel.clone()).await;
    tracing::info!(
        verified = summary.verified,
        partially_failed = summary.partially_failed,
        cancelled = summary.cancelled,
        failed = summary.failed,
        "download: done"
    );

    if cancel.is_cancelled() {
        anyhow::bail!("download interrupted; partial books were removed");
    }
    Ok(())
}

/// Downloads every book with at most `limit` books in flight. Each book's
/// text and audio parts share that book's slot.
pub async fn download_books(
    books: Vec<Book>,
    fetcher: Arc<dyn AssetFetcher>,
    resolver: Arc<dyn MetadataExtractor>,
    layout: DownloadLayout,
    limit: usize,
    cancel: CancellationToken,
) -> DownloadSummary {
    let layout = Arc::new(layout);
    let mut pool = BoundedTaskPool::new(limit, cancel);
    for book in books {
        let fetcher = Arc::clone(&fetcher);
        let resolver = Arc::clone(&resolver);
        let layout = Arc::clone(&layout);
        pool.submit(move |cancel| async move {
            let outcome =
                download_book(&book, fetcher.as_ref(), resolver.as_ref(), &layout, &cancel).await;
            (book.slug(), outcome)
        });
    }

    let mut summary = DownloadSummary::default();
    let mut progress = ProgressLog::new("download");
    while let Some(outcome) = pool.next().await {
        match outcome {
            TaskOutcome::Finished((_, BookOutcome::Verified { .. })) => summary.verified += 1,
            TaskOutcome::Finished((_, BookOutcome::PartiallyFailed { .. })) => {
                summary.partially_failed += 1
            }
            TaskOutcome::Finished((_, BookOutcome::CancelledAndCleaned)) | TaskOutcome::NotStarted => {
                summary.cancelled += 1
            }
            TaskOutcome::Finished((book, BookOutcome::Failed { reason })) => {
                tracing::error!(book = %book, %reason, "book download failed");
                summary.failed += 1;
            }
            TaskOutcome::Panicked(reason) => {
                tracing::error!(%reason, "book download task panicked");
                summary.failed += 1;
            }
        }
        progress.observe(
            pool.progress(),
            summary.failed + summary.partially_failed,
        );
    }
    summary
}

/// One book: resolve part links, then fetch text and parts concurrently.
/// Cancellation removes everything this book may have written.
pub async fn download_book(
    book: &Book,
    fetcher: &dyn AssetFetcher,
    resolver: &dyn MetadataExtractor,
    layout: &DownloadLayout,
    cancel: &CancellationToken,
) -> BookOutcome {
    let slug = book.slug();
    if slug.is_empty() {
        return BookOutcome::Failed {
            reason: format!("cannot derive book identity from {}", book.text_url),
        };
    }
    log_state(&slug, BookState::Pending);

    let audio_dir = layout.book_audio_dir(&slug);
    let text_target = book
        .text_download_url
        .as_deref()
        .map(|url| (url, layout.text_path(&slug, url)));

    let work = async {
        log_state(&slug, BookState::ResolvingLinks);
        let part_urls = match resolver.resolve_audio_parts(&book.audio_url).await {
            Ok(urls) if !urls.is_empty() => urls,
            Ok(_) | Err(_) if !book.audio_download_urls.is_empty() => {
                tracing::warn!(book = %slug, "part link resolution failed; using stored links");
                book.audio_download_urls.clone()
            }
            Ok(_) => {
                return BookOutcome::Failed {
                    reason: format!("no audio parts listed on {}", book.audio_url),
                };
            }
            Err(err) => {
                return BookOutcome::Failed {
                    reason: format!("resolve audio parts: {err:#}"),
                };
            }
        };

        log_state(&slug, BookState::Fetching);
        let mut jobs: Vec<(String, PathBuf)> = Vec::with_capacity(part_urls.len() + 1);
        match &text_target {
            Some((url, path)) => jobs.push(((*url).to_owned(), path.clone())),
            None => tracing::warn!(book = %slug, "no text download link"),
        }
        for (idx, url) in part_urls.iter().enumerate() {
            jobs.push((url.clone(), layout.part_path(&slug, idx + 1, url)));
        }

        let total = jobs.len() + usize::from(text_target.is_none());
        let book_id = slug.as_str();
        let results = futures::future::join_all(jobs.iter().map(|(url, dest)| async move {
            match fetcher.fetch(url, dest).await {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(book = book_id, error = %err, "fetch skipped");
                    false
                }
            }
        }))
        .await;

        let failed = results.iter().filter(|ok| !**ok).count() + usize::from(text_target.is_none());
        if failed == 0 {
            BookOutcome::Verified { files: total }
        } else {
            BookOutcome::PartiallyFailed { failed, total }
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            // `work` is dropped before this handler runs; no fetch is still writing.
            cleanup_book(&audio_dir, text_target.as_ref().map(|(_, path)| path.as_path())).await;
            BookOutcome::CancelledAndCleaned
        }
        outcome = work => outcome,
    };

    match &outcome {
        BookOutcome::Verified { .. } => log_state(&slug, BookState::Verified),
        BookOutcome::PartiallyFailed { failed, total } => {
            tracing::warn!(book = %slug, state = %BookState::PartiallyFailed, failed, total, "book state");
        }
        BookOutcome::CancelledAndCleaned => log_state(&slug, BookState::CancelledAndCleaned),
        BookOutcome::Failed { .. } => {}
    }
    outcome
}

fn log_state(slug: &str, state: BookState) {
    tracing::debug!(book = slug, state = %state, "book state");
}

async fn cleanup_book(audio_dir: &Path, text_path: Option<&Path>) {
    match tokio::fs::remove_dir_all(audio_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::error!(path = %audio_dir.display(), error = %err, "remove partial audio dir")
        }
    }
    if let Some(text_path) = text_path {
        match tokio::fs::remove_file(text_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::error!(path = %text_path.display(), error = %err, "remove partial text file")
            }
        }
    }
}
