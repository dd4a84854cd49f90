use std::fs;
use std::path::Path;

use audiobook_harvest::formats::{Book, Narrator};
use audiobook_harvest::ledger::Ledger;
use predicates::prelude::*;

fn write_record(dir: &Path, slug: &str, audio_kind: &str) {
    let book = Book {
        name: format!("Book {slug}"),
        author: "Author".to_owned(),
        duration: "0:45:00".to_owned(),
        narrators: vec![Narrator::unknown()],
        text_url: format!("https://example.com/ebook/{slug}"),
        audio_url: format!("https://audio.example.com/{audio_kind}/{slug}"),
        text_download_url: None,
        audio_download_urls: Vec::new(),
        fetched_at: None,
    };
    fs::write(
        dir.join(format!("{slug}.json")),
        serde_json::to_vec_pretty(&book).expect("serialize record"),
    )
    .expect("write record");
}

fn write_config(root: &Path) -> std::path::PathBuf {
    let config_path = root.join("pipeline.yaml");
    let yaml = format!(
        "paths:\n  metadata_dir: {}\n  ledger_path: {}\n",
        root.join("metadata").display(),
        root.join("books.jsonl").display()
    );
    fs::write(&config_path, yaml).expect("write config");
    config_path
}

#[test]
fn consolidate_drops_episodic_and_corrupt_records() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let metadata_dir = temp.path().join("metadata");
    fs::create_dir_all(&metadata_dir).expect("create metadata dir");
    write_record(&metadata_dir, "alpha", "audiobooks");
    write_record(&metadata_dir, "beta", "audiobooks");
    write_record(&metadata_dir, "serial", "tvshows");
    fs::write(metadata_dir.join("broken.json"), b"{ not json").expect("write corrupt record");
    let config_path = write_config(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("audiobook-harvest");
    cmd.args(["consolidate", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stderr(predicate::str::contains("consolidate: ledger written"));

    let ledger = Ledger::load(&temp.path().join("books.jsonl")).expect("load ledger");
    let ids: Vec<_> = ledger.rows().iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert_eq!(ledger.rows()[0].duration_hours, Some(0.75));
}

#[test]
fn download_without_ledger_fails() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("audiobook-harvest");
    cmd.args(["download", "--all", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("load ledger"));
}

#[test]
fn download_requires_a_selection() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("audiobook-harvest");
    cmd.args(["download", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one of name, author or narrator"));
}

#[test]
fn debug_log_env_shows_parsed_cli() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let config_path = write_config(temp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("audiobook-harvest");
    cmd.env("AUDIOBOOK_HARVEST_LOG", "debug")
        .args(["consolidate", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
