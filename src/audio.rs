//! Audio qualification: group raw parts per book, gate on sample rate,
//! convert and concatenate qualifying books, reconcile the ledger.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context as _;
use lofty::file::AudioFile as _;

use crate::cli::QualifyArgs;
use crate::config::{AudioConfig, ConversionFailurePolicy, PipelineConfig};
use crate::ledger::Ledger;

/// Raw parts of one book, in narration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudiobookGroup {
    pub book_id: String,
    pub parts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    Qualified {
        combined: PathBuf,
        mean_sample_rate: f64,
        missing_parts: usize,
    },
    Disqualified {
        min_sample_rate: u32,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualificationSummary {
    pub groups: usize,
    pub qualified: usize,
    pub unqualified: usize,
    pub failed: usize,
    pub format_invalid: usize,
}

pub trait SampleRateProbe: Send + Sync {
    fn sample_rate(&self, path: &Path) -> anyhow::Result<u32>;
}

/// Reads the sample rate from container metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyProbe;

impl SampleRateProbe for LoftyProbe {
    fn sample_rate(&self, path: &Path) -> anyhow::Result<u32> {
        let tagged = lofty::read_from_path(path)
            .with_context(|| format!("read audio properties: {}", path.display()))?;
        tagged
            .properties()
            .sample_rate()
            .ok_or_else(|| anyhow::anyhow!("no sample rate in {}", path.display()))
    }
}

pub trait AudioConverter: Send + Sync {
    /// Re-encodes `src` into the format implied by `dst`.
    fn convert(&self, src: &Path, dst: &Path) -> anyhow::Result<()>;

    /// Joins same-format `inputs`, in order, into `out` without re-encoding.
    fn concat(&self, inputs: &[PathBuf], out: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    bin: PathBuf,
}

impl FfmpegConverter {
    pub fn locate(bin: &str) -> anyhow::Result<Self> {
        let bin = which::which(bin)
            .with_context(|| format!("{bin} is not installed or not in PATH"))?;
        Ok(Self { bin })
    }

    fn run(&self, args: &[&OsStr]) -> anyhow::Result<()> {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawn {}", self.bin.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            anyhow::bail!(
                "{} failed ({}): {}",
                self.bin.display(),
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
        }
        Ok(())
    }
}

impl AudioConverter for FfmpegConverter {
    fn convert(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        self.run(&[OsStr::new("-y"), OsStr::new("-i"), src.as_os_str(), dst.as_os_str()])
    }

    fn concat(&self, inputs: &[PathBuf], out: &Path) -> anyhow::Result<()> {
        let dir = match out.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut list = tempfile::Builder::new()
            .prefix("concat-")
            .suffix(".txt")
            .tempfile_in(dir)
            .context("create concat list")?;
        for input in inputs {
            let absolute = std::fs::canonicalize(input)
                .with_context(|| format!("resolve concat input: {}", input.display()))?;
            let quoted = absolute.to_string_lossy().replace('\'', r"'\''");
            writeln!(list, "file '{quoted}'").context("write concat list")?;
        }
        list.flush().context("flush concat list")?;

        self.run(&[
            OsStr::new("-y"),
            OsStr::new("-f"),
            OsStr::new("concat"),
            OsStr::new("-safe"),
            OsStr::new("0"),
            OsStr::new("-i"),
            list.path().as_os_str(),
            OsStr::new("-c"),
            OsStr::new("copy"),
            out.as_os_str(),
        ])
    }
}

pub async fn run(_args: QualifyArgs, config: &PipelineConfig) -> anyhow::Result<()> {
    let config = config.clone();
    let summary = tokio::task::spawn_blocking(move || {
        let converter = FfmpegConverter::locate(&config.audio.ffmpeg_bin)?;
        let roots = AudioRoots::from_config(&config);
        qualify(
            &roots,
            Some(config.paths.ledger_path.as_path()),
            &LoftyProbe,
            &converter,
            &config.audio,
        )
    })
    .await
    .context("spawn_blocking join")??;

    if summary.groups == 0 {
        tracing::warn!("qualify: no audio parts found");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AudioRoots {
    pub raw: PathBuf,
    pub qualified: PathBuf,
    pub unqualified: PathBuf,
}

impl AudioRoots {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            raw: config.paths.audio_raw_dir.clone(),
            qualified: config.paths.audio_qualified_dir.clone(),
            unqualified: config.paths.audio_unqualified_dir.clone(),
        }
    }
}

/// Runs the whole qualification stage. The ledger (when present) is read once
/// and rewritten once at the end.
pub fn qualify(
    roots: &AudioRoots,
    ledger_path: Option<&Path>,
    probe: &dyn SampleRateProbe,
    converter: &dyn AudioConverter,
    audio: &AudioConfig,
) -> anyhow::Result<QualificationSummary> {
    for dir in [&roots.raw, &roots.qualified, &roots.unqualified] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output dir: {}", dir.display()))?;
    }

    let mut ledger = match ledger_path {
        Some(path) if path.exists() => Some(Ledger::load(path).context("load ledger")?),
        Some(path) => {
            tracing::warn!(ledger = %path.display(), "ledger not found; qualification results will not be recorded");
            None
        }
        None => None,
    };

    let (groups, format_invalid) =
        group_audiobooks(&roots.raw, &roots.unqualified, &audio.source_extension)?;
    let mut summary = QualificationSummary {
        groups: groups.len(),
        format_invalid,
        ..QualificationSummary::default()
    };

    for group in &groups {
        let outcome = qualify_group(group, roots, probe, converter, audio)?;
        let has_ledger = ledger.is_some();
        let row = ledger.as_mut().and_then(|ledger| ledger.row_mut(&group.book_id));
        if row.is_none() && has_ledger {
            tracing::warn!(book = %group.book_id, "no ledger row for audio group");
        }

        match &outcome {
            GroupOutcome::Qualified {
                combined,
                mean_sample_rate,
                missing_parts,
            } => {
                summary.qualified += 1;
                tracing::info!(
                    book = %group.book_id,
                    combined = %combined.display(),
                    mean_sample_rate,
                    missing_parts,
                    "qualified"
                );
                if let Some(row) = row {
                    row.qualified = Some(true);
                    row.sample_rate = Some(*mean_sample_rate);
                }
            }
            GroupOutcome::Disqualified { min_sample_rate } => {
                summary.unqualified += 1;
                tracing::warn!(
                    book = %group.book_id,
                    min_sample_rate,
                    threshold = audio.min_sample_rate,
                    "unqualified"
                );
                if let Some(row) = row {
                    row.qualified = Some(false);
                }
            }
            GroupOutcome::Failed { reason } => {
                summary.failed += 1;
                tracing::error!(book = %group.book_id, %reason, "audio processing failed");
            }
        }
    }

    remove_empty_dirs(&roots.raw);

    if let (Some(ledger), Some(path)) = (&ledger, ledger_path) {
        ledger.save_atomic(path).context("save ledger")?;
    }

    tracing::info!(
        groups = summary.groups,
        qualified = summary.qualified,
        unqualified = summary.unqualified,
        failed = summary.failed,
        format_invalid = summary.format_invalid,
        threshold = audio.min_sample_rate,
        "qualify: done"
    );
    Ok(summary)
}

/// Groups raw parts by book. Files with the wrong extension are moved to
/// `unqualified_root`; the count of those is returned alongside the groups.
pub fn group_audiobooks(
    raw_root: &Path,
    unqualified_root: &Path,
    extension: &str,
) -> anyhow::Result<(Vec<AudiobookGroup>, usize)> {
    // Parts inside a per-book directory belong to that book; loose files are
    // keyed by the text before their first `_`.
    let mut files: Vec<(Option<String>, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(raw_root)
        .with_context(|| format!("read raw audio dir: {}", raw_root.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            let dir_name = file_name_of(&path);
            for nested in std::fs::read_dir(&path)
                .with_context(|| format!("read book dir: {}", path.display()))?
            {
                let nested = nested?.path();
                if nested.is_file() {
                    files.push((Some(dir_name.clone()), nested));
                }
            }
        } else if path.is_file() {
            files.push((None, path));
        }
    }

    let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut format_invalid = 0;
    for (dir_name, path) in files {
        let has_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        let file_name = file_name_of(&path);
        if !has_extension {
            tracing::warn!(file = %file_name, dest = %unqualified_root.display(), "not an audio part; moving to unqualified");
            move_into(&path, unqualified_root)?;
            format_invalid += 1;
            continue;
        }
        let book_id = dir_name.unwrap_or_else(|| {
            file_name
                .split('_')
                .next()
                .unwrap_or_default()
                .to_owned()
        });
        grouped.entry(book_id).or_default().push(path);
    }

    let groups = grouped
        .into_iter()
        .map(|(book_id, mut parts)| {
            parts.sort_by(|a, b| part_sort_key(a).cmp(&part_sort_key(b)));
            AudiobookGroup { book_id, parts }
        })
        .collect();
    Ok((groups, format_invalid))
}

/// Sequence number from a `<book>_<n>` file stem.
fn part_index(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.rsplit_once('_'))
        .and_then(|(_, n)| n.parse::<u64>().ok())
}

/// Parts order by their numeric `_<n>` suffix, then by name.
fn part_sort_key(path: &Path) -> (u64, String) {
    (part_index(path).unwrap_or(0), file_name_of(path))
}

/// Numbers missing from the `1..=max` run of part suffixes.
fn sequence_gaps(parts: &[PathBuf]) -> usize {
    let indices: std::collections::BTreeSet<u64> =
        parts.iter().filter_map(|part| part_index(part)).collect();
    let Some(&last) = indices.last() else {
        return 0;
    };
    let expected = usize::try_from(last).unwrap_or(usize::MAX);
    let present = indices.iter().filter(|&&idx| idx >= 1).count();
    expected.saturating_sub(present)
}

fn qualify_group(
    group: &AudiobookGroup,
    roots: &AudioRoots,
    probe: &dyn SampleRateProbe,
    converter: &dyn AudioConverter,
    audio: &AudioConfig,
) -> anyhow::Result<GroupOutcome> {
    let sample_rates: Vec<u32> = group
        .parts
        .iter()
        .map(|part| match probe.sample_rate(part) {
            Ok(rate) => rate,
            Err(err) => {
                tracing::error!(path = %part.display(), error = %format!("{err:#}"), "sample rate unreadable");
                0
            }
        })
        .collect();
    let min_sample_rate = sample_rates.iter().copied().min().unwrap_or(0);

    if min_sample_rate < audio.min_sample_rate {
        tracing::debug!(book = %group.book_id, ?sample_rates, "below sample rate threshold");
        for part in &group.parts {
            move_into(part, &roots.unqualified)?;
        }
        return Ok(GroupOutcome::Disqualified { min_sample_rate });
    }

    let gaps = sequence_gaps(&group.parts);
    if gaps > 0 {
        tracing::warn!(book = %group.book_id, gaps, "part sequence has gaps");
        if audio.on_conversion_failure == ConversionFailurePolicy::FailGroup {
            return Ok(GroupOutcome::Failed {
                reason: format!("{gaps} parts missing from the sequence"),
            });
        }
    }

    // Only the combined file lands in the qualified root.
    let scratch = tempfile::Builder::new()
        .prefix(".convert-")
        .tempdir_in(&roots.qualified)
        .with_context(|| format!("create scratch dir in {}", roots.qualified.display()))?;

    let mut converted = Vec::with_capacity(group.parts.len());
    let mut missing_parts = gaps;
    for part in &group.parts {
        let stem = part
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(group.book_id.as_str());
        let target = scratch
            .path()
            .join(format!("{stem}.{}", audio.target_extension));
        match converter.convert(part, &target) {
            Ok(()) => converted.push(target),
            Err(err) => {
                tracing::error!(path = %part.display(), error = %format!("{err:#}"), "conversion failed");
                missing_parts += 1;
            }
        }
    }

    let failed_conversions = missing_parts - gaps;
    if failed_conversions > 0 && audio.on_conversion_failure == ConversionFailurePolicy::FailGroup
    {
        return Ok(GroupOutcome::Failed {
            reason: format!(
                "{failed_conversions} of {} parts failed to convert",
                group.parts.len()
            ),
        });
    }
    if converted.is_empty() {
        return Ok(GroupOutcome::Failed {
            reason: "no part converted".to_owned(),
        });
    }
    if missing_parts > 0 {
        tracing::warn!(book = %group.book_id, missing_parts, "concatenating with missing parts");
    }

    let combined = roots
        .qualified
        .join(format!("{}.{}", group.book_id, audio.target_extension));
    if let Err(err) = converter.concat(&converted, &combined) {
        remove_quietly(&combined);
        return Ok(GroupOutcome::Failed {
            reason: format!("concatenate: {err:#}"),
        });
    }
    if let Err(err) = scratch.close() {
        tracing::warn!(book = %group.book_id, error = %err, "remove scratch dir");
    }

    let mean_sample_rate =
        sample_rates.iter().map(|&rate| f64::from(rate)).sum::<f64>() / sample_rates.len() as f64;
    Ok(GroupOutcome::Qualified {
        combined,
        mean_sample_rate,
        missing_parts,
    })
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Moves `path` into `dir`, copying across filesystems when rename cannot.
fn move_into(path: &Path, dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    let dest = dir.join(file_name_of(path));
    if std::fs::rename(path, &dest).is_ok() {
        return Ok(dest);
    }
    std::fs::copy(path, &dest)
        .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;
    std::fs::remove_file(path).with_context(|| format!("remove moved file: {}", path.display()))?;
    Ok(dest)
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "remove file");
    }
}

fn remove_empty_dirs(raw_root: &Path) {
    let Ok(entries) = std::fs::read_dir(raw_root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        // Only succeeds for empty directories.
        if path.is_dir() && std::fs::remove_dir(&path).is_ok() {
            tracing::debug!(path = %path.display(), "removed empty book dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::formats::{Book, Narrator};

    /// Sample rate keyed by file name; unknown files are unreadable.
    struct FakeProbe(HashMap<String, u32>);

    impl SampleRateProbe for FakeProbe {
        fn sample_rate(&self, path: &Path) -> anyhow::Result<u32> {
            self.0
                .get(&file_name_of(path))
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unreadable"))
        }
    }

    /// Copies bytes for conversion and appends them for concatenation.
    #[derive(Default)]
    struct FakeConverter {
        fail_on: Vec<String>,
        concatenated: Mutex<Vec<Vec<String>>>,
    }

    impl AudioConverter for FakeConverter {
        fn convert(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
            if self.fail_on.contains(&file_name_of(src)) {
                anyhow::bail!("decoder error");
            }
            std::fs::copy(src, dst)?;
            Ok(())
        }

        fn concat(&self, inputs: &[PathBuf], out: &Path) -> anyhow::Result<()> {
            let mut joined = Vec::new();
            for input in inputs {
                joined.extend(std::fs::read(input)?);
            }
            std::fs::write(out, joined)?;
            self.concatenated
                .lock()
                .unwrap()
                .push(inputs.iter().map(|p| file_name_of(p)).collect());
            Ok(())
        }
    }

    fn write_part(root: &Path, book: &str, index: usize) -> anyhow::Result<PathBuf> {
        let dir = root.join(book);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{book}_{index}.mp3"));
        std::fs::write(&path, format!("[{book}-{index}]"))?;
        Ok(path)
    }

    fn roots(base: &Path) -> AudioRoots {
        AudioRoots {
            raw: base.join("raw"),
            qualified: base.join("qualified"),
            unqualified: base.join("unqualified"),
        }
    }

    fn ledger_book(slug: &str) -> Book {
        Book {
            name: slug.to_owned(),
            author: "Author".to_owned(),
            duration: "2:00:00".to_owned(),
            narrators: vec![Narrator::unknown()],
            text_url: format!("https://example.com/ebook/{slug}"),
            audio_url: format!("https://audio.example.com/audiobooks/{slug}"),
            text_download_url: None,
            audio_download_urls: Vec::new(),
            fetched_at: None,
        }
    }

    fn names(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = std::fs::read_dir(dir)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    #[test]
    fn grouping_orders_parts_by_sequence_and_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        for idx in [10, 2, 1, 9] {
            write_part(&roots.raw, "alpha", idx)?;
        }
        write_part(&roots.raw, "beta", 1)?;
        std::fs::write(roots.raw.join("alpha").join("cover.jpg"), b"jpg")?;

        let (first, invalid) = group_audiobooks(&roots.raw, &roots.unqualified, "mp3")?;
        assert_eq!(invalid, 1);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].book_id, "alpha");
        let order: Vec<_> = first[0].parts.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(
            order,
            vec!["alpha_1.mp3", "alpha_2.mp3", "alpha_9.mp3", "alpha_10.mp3"]
        );
        assert_eq!(names(&roots.unqualified)?, vec!["cover.jpg"]);

        let (second, invalid) = group_audiobooks(&roots.raw, &roots.unqualified, "mp3")?;
        assert_eq!(invalid, 0);
        assert_eq!(second, first);
        Ok(())
    }

    #[test]
    fn one_low_part_disqualifies_the_whole_book() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        let ledger_path = temp.path().join("books.jsonl");
        let (ledger, _) = Ledger::from_books([ledger_book("good"), ledger_book("poor")]);
        ledger.save_atomic(&ledger_path)?;

        for idx in 1..=2 {
            write_part(&roots.raw, "good", idx)?;
            write_part(&roots.raw, "poor", idx)?;
        }
        let probe = FakeProbe(HashMap::from([
            ("good_1.mp3".to_owned(), 44_100),
            ("good_2.mp3".to_owned(), 48_000),
            ("poor_1.mp3".to_owned(), 44_100),
            ("poor_2.mp3".to_owned(), 22_050),
        ]));
        let converter = FakeConverter::default();

        let summary = qualify(
            &roots,
            Some(ledger_path.as_path()),
            &probe,
            &converter,
            &AudioConfig::default(),
        )?;

        assert_eq!(
            summary,
            QualificationSummary {
                groups: 2,
                qualified: 1,
                unqualified: 1,
                failed: 0,
                format_invalid: 0,
            }
        );
        assert_eq!(names(&roots.qualified)?, vec!["good.wav"]);
        assert_eq!(
            std::fs::read_to_string(roots.qualified.join("good.wav"))?,
            "[good-1][good-2]"
        );
        assert_eq!(names(&roots.unqualified)?, vec!["poor_1.mp3", "poor_2.mp3"]);
        assert!(!roots.raw.join("poor").exists());

        let ledger = Ledger::load(&ledger_path)?;
        let good = &ledger.rows()[0];
        assert_eq!(good.qualified, Some(true));
        assert_eq!(good.sample_rate, Some(46_050.0));
        let poor = &ledger.rows()[1];
        assert_eq!(poor.qualified, Some(false));
        assert_eq!(poor.sample_rate, None);
        Ok(())
    }

    #[test]
    fn unreadable_part_counts_as_zero() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        write_part(&roots.raw, "mystery", 1)?;

        let summary = qualify(
            &roots,
            None,
            &FakeProbe(HashMap::new()),
            &FakeConverter::default(),
            &AudioConfig::default(),
        )?;

        assert_eq!(summary.unqualified, 1);
        assert_eq!(names(&roots.unqualified)?, vec!["mystery_1.mp3"]);
        Ok(())
    }

    #[test]
    fn conversion_failure_fails_group_by_default() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        let ledger_path = temp.path().join("books.jsonl");
        Ledger::from_books([ledger_book("book")]).0.save_atomic(&ledger_path)?;
        for idx in 1..=3 {
            write_part(&roots.raw, "book", idx)?;
        }
        let probe = FakeProbe(
            (1..=3)
                .map(|idx| (format!("book_{idx}.mp3"), 44_100))
                .collect(),
        );
        let converter = FakeConverter {
            fail_on: vec!["book_2.mp3".to_owned()],
            ..FakeConverter::default()
        };

        let summary = qualify(
            &roots,
            Some(ledger_path.as_path()),
            &probe,
            &converter,
            &AudioConfig::default(),
        )?;

        assert_eq!(summary.failed, 1);
        assert!(names(&roots.qualified)?.is_empty());
        assert_eq!(names(&roots.raw.join("book"))?.len(), 3);
        assert!(converter.concatenated.lock().unwrap().is_empty());
        assert_eq!(Ledger::load(&ledger_path)?.rows()[0].qualified, None);
        Ok(())
    }

    #[test]
    fn skip_part_policy_concatenates_the_rest() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        for idx in 1..=3 {
            write_part(&roots.raw, "book", idx)?;
        }
        let probe = FakeProbe(
            (1..=3)
                .map(|idx| (format!("book_{idx}.mp3"), 48_000))
                .collect(),
        );
        let converter = FakeConverter {
            fail_on: vec!["book_2.mp3".to_owned()],
            ..FakeConverter::default()
        };
        let audio = AudioConfig {
            on_conversion_failure: ConversionFailurePolicy::SkipPart,
            ..AudioConfig::default()
        };

        let summary = qualify(&roots, None, &probe, &converter, &audio)?;

        assert_eq!(summary.qualified, 1);
        assert_eq!(
            *converter.concatenated.lock().unwrap(),
            vec![vec!["book_1.wav".to_owned(), "book_3.wav".to_owned()]]
        );
        assert_eq!(names(&roots.qualified)?, vec!["book.wav"]);
        Ok(())
    }

    #[test]
    fn single_unsuffixed_part_keeps_its_combined_file() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        std::fs::create_dir_all(&roots.raw)?;
        std::fs::write(roots.raw.join("solo.mp3"), b"[solo]")?;
        let probe = FakeProbe(HashMap::from([("solo.mp3".to_owned(), 48_000)]));

        let summary = qualify(
            &roots,
            None,
            &probe,
            &FakeConverter::default(),
            &AudioConfig::default(),
        )?;

        assert_eq!(summary.qualified, 1);
        assert_eq!(names(&roots.qualified)?, vec!["solo.wav"]);
        assert_eq!(
            std::fs::read_to_string(roots.qualified.join("solo.wav"))?,
            "[solo]"
        );
        Ok(())
    }

    #[test]
    fn book_directory_name_is_the_group_id() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        write_part(&roots.raw, "my_book", 2)?;
        write_part(&roots.raw, "my_book", 1)?;
        std::fs::write(roots.raw.join("loose_1.mp3"), b"[loose]")?;

        let (groups, _) = group_audiobooks(&roots.raw, &roots.unqualified, "mp3")?;

        let ids: Vec<_> = groups.iter().map(|g| g.book_id.as_str()).collect();
        assert_eq!(ids, vec!["loose", "my_book"]);
        let order: Vec<_> = groups[1].parts.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(order, vec!["my_book_1.mp3", "my_book_2.mp3"]);
        Ok(())
    }

    #[test]
    fn underscored_slug_updates_its_ledger_row() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        let ledger_path = temp.path().join("books.jsonl");
        Ledger::from_books([ledger_book("my_book")]).0.save_atomic(&ledger_path)?;
        write_part(&roots.raw, "my_book", 1)?;
        let probe = FakeProbe(HashMap::from([("my_book_1.mp3".to_owned(), 44_100)]));

        qualify(
            &roots,
            Some(ledger_path.as_path()),
            &probe,
            &FakeConverter::default(),
            &AudioConfig::default(),
        )?;

        assert_eq!(names(&roots.qualified)?, vec!["my_book.wav"]);
        assert_eq!(Ledger::load(&ledger_path)?.rows()[0].qualified, Some(true));
        Ok(())
    }

    #[test]
    fn sequence_gap_follows_the_failure_policy() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let roots = roots(temp.path());
        std::fs::create_dir_all(&roots.qualified)?;
        let group = AudiobookGroup {
            book_id: "book".to_owned(),
            parts: vec![
                write_part(&roots.raw, "book", 1)?,
                write_part(&roots.raw, "book", 3)?,
            ],
        };
        assert_eq!(sequence_gaps(&group.parts), 1);
        let probe = FakeProbe(HashMap::from([
            ("book_1.mp3".to_owned(), 44_100),
            ("book_3.mp3".to_owned(), 44_100),
        ]));

        let converter = FakeConverter::default();
        let outcome = qualify_group(&group, &roots, &probe, &converter, &AudioConfig::default())?;
        assert!(matches!(outcome, GroupOutcome::Failed { .. }));
        assert!(converter.concatenated.lock().unwrap().is_empty());
        assert!(names(&roots.qualified)?.is_empty());

        let audio = AudioConfig {
            on_conversion_failure: ConversionFailurePolicy::SkipPart,
            ..AudioConfig::default()
        };
        let outcome = qualify_group(&group, &roots, &probe, &converter, &audio)?;
        assert_eq!(
            outcome,
            GroupOutcome::Qualified {
                combined: roots.qualified.join("book.wav"),
                mean_sample_rate: 44_100.0,
                missing_parts: 1,
            }
        );
        Ok(())
    }

    /// Minimal PCM WAV: RIFF header, `fmt ` chunk, short `data` chunk.
    fn wav_bytes(sample_rate: u32) -> Vec<u8> {
        let channels: u16 = 1;
        let bits: u16 = 16;
        let data: Vec<u8> = vec![0; 4410 * 2];
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bits / 8);
        let block_align = channels * (bits / 8);

        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16_u32.to_le_bytes());
        out.extend_from_slice(&1_u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn lofty_probe_reads_container_sample_rate() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(22_050))?;
        assert_eq!(LoftyProbe.sample_rate(&path)?, 22_050);

        let garbage = temp.path().join("garbage.mp3");
        std::fs::write(&garbage, b"not audio")?;
        assert!(LoftyProbe.sample_rate(&garbage).is_err());
        Ok(())
    }
}
