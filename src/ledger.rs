//! Consolidated per-book table: selection queries and qualification status.
//!
//! Stored as JSON Lines, one [`LedgerRow`] per book. Row order is fixed when
//! the ledger is built and preserved by every later rewrite.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufRead as _, BufReader, BufWriter, Write as _};
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::formats::Book;

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub schema_version: u32,
    pub id: String,
    #[serde(flatten)]
    pub book: Book,
    pub duration_hours: Option<f64>,
    pub sample_rate: Option<f64>,
    pub qualified: Option<bool>,
    // Filled by downstream text/audio statistics.
    pub word_count: Option<u64>,
    pub num_sentences: Option<u64>,
    pub audio_size: Option<u64>,
    pub text_size: Option<u64>,
}

impl LedgerRow {
    pub fn from_book(book: Book) -> Self {
        let duration_hours = crate::metadata::duration_hours(&book.duration);
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            id: book.slug(),
            book,
            duration_hours,
            sample_rate: None,
            qualified: None,
            word_count: None,
            num_sentences: None,
            audio_size: None,
            text_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub rows: usize,
    pub filtered: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    rows: Vec<LedgerRow>,
}

impl Ledger {
    /// Folds validated records into rows: episodic sources are dropped and the
    /// first record per text page wins.
    pub fn from_books(books: impl IntoIterator<Item = Book>) -> (Self, FoldStats) {
        let mut stats = FoldStats::default();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();

        for book in books {
            if book.is_episodic() {
                stats.filtered += 1;
                continue;
            }
            if !seen.insert(book.text_url.clone()) {
                tracing::warn!(text_url = %book.text_url, "duplicate book record; keeping the first");
                stats.duplicates += 1;
                continue;
            }
            rows.push(LedgerRow::from_book(book));
        }

        stats.rows = rows.len();
        (Self { rows }, stats)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open ledger: {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.context("read ledger line")?;
            if line.trim().is_empty() {
                continue;
            }
            let row: LedgerRow = serde_json::from_str(&line)
                .with_context(|| format!("parse ledger row {}: {}", idx + 1, path.display()))?;
            if row.schema_version != LEDGER_SCHEMA_VERSION {
                anyhow::bail!(
                    "unsupported ledger schema version {} (expected {LEDGER_SCHEMA_VERSION}) at row {}",
                    row.schema_version,
                    idx + 1
                );
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    /// Writes to a sibling temp file, then renames it over `path`, so readers
    /// see either the old or the new ledger.
    pub fn save_atomic(&self, path: &Path) -> anyhow::Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create ledger dir: {}", parent.display()))?;

        let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .with_context(|| format!("create ledger tmp: {}", tmp_path.display()))?;
        let mut out = BufWriter::new(file);
        for row in &self.rows {
            serde_json::to_writer(&mut out, row).context("serialize ledger row")?;
            out.write_all(b"\n").context("write ledger newline")?;
        }
        let file = out
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flush ledger tmp: {}", err.error()))?;
        file.sync_all().context("sync ledger tmp")?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename ledger tmp to final: {}", path.display()))?;
        Ok(())
    }

    /// Copies qualification results and statistics from rows of `previous`
    /// with the same id. Returns how many rows were matched.
    pub fn carry_over(&mut self, previous: &Ledger) -> usize {
        let mut carried = 0;
        for row in &mut self.rows {
            let Some(old) = previous.rows.iter().find(|old| old.id == row.id) else {
                continue;
            };
            row.sample_rate = old.sample_rate;
            row.qualified = old.qualified;
            row.word_count = old.word_count;
            row.num_sentences = old.num_sentences;
            row.audio_size = old.audio_size;
            row.text_size = old.text_size;
            carried += 1;
        }
        carried
    }

    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_mut(&mut self, id: &str) -> Option<&mut LedgerRow> {
        self.rows.iter_mut().find(|row| row.id == id)
    }

    pub fn select(&self, selection: &Selection) -> Vec<&LedgerRow> {
        self.rows.iter().filter(|row| selection.matches(row)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Filter {
        name: Option<String>,
        author: Option<String>,
        narrator: Option<String>,
    },
}

impl Selection {
    pub fn filter(
        name: Option<String>,
        author: Option<String>,
        narrator: Option<String>,
    ) -> anyhow::Result<Self> {
        if name.is_none() && author.is_none() && narrator.is_none() {
            anyhow::bail!("a filter needs at least one of name, author or narrator");
        }
        Ok(Self::Filter {
            name,
            author,
            narrator,
        })
    }

    /// Exact, case-sensitive match on every given field.
    pub fn matches(&self, row: &LedgerRow) -> bool {
        match self {
            Self::All => true,
            Self::Filter {
                name,
                author,
                narrator,
            } => {
                name.as_deref().is_none_or(|name| row.book.name == name)
                    && author.as_deref().is_none_or(|author| row.book.author == author)
                    && narrator.as_deref().is_none_or(|narrator| {
                        row.book.narrators.iter().any(|n| n.name == narrator)
                    })
            }
        }
    }
}
