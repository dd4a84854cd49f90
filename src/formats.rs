use serde::{Deserialize, Serialize};
use url::Url;

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narrator {
    pub name: String,
    pub url: String,
}

impl Narrator {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_owned(),
            url: UNKNOWN.to_owned(),
        }
    }
}

/// Per-book metadata record, persisted as `<metadata_dir>/<page>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub name: String,
    pub author: String,
    pub duration: String,
    pub narrators: Vec<Narrator>,
    pub text_url: String,
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_download_url: Option<String>,
    #[serde(default)]
    pub audio_download_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
}

impl Book {
    pub fn slug(&self) -> String {
        book_slug(&self.text_url)
    }

    /// Audio pages under a series/TV section are not books.
    pub fn is_episodic(&self) -> bool {
        self.audio_url.contains("tvshows")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPages {
    pub text_page_url: String,
    pub audio_page_url: String,
}

/// Last non-empty path segment of `url`.
pub fn last_path_segment(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_owned(),
    };
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default()
        .to_owned()
}

/// Book identity used for file names and ledger rows.
pub fn book_slug(url: &str) -> String {
    let segment = last_path_segment(url);
    segment.split('.').next().unwrap_or_default().to_owned()
}

/// Extension (without the dot) of the last path segment of `url`.
pub fn url_extension(url: &str) -> Option<String> {
    let segment = last_path_segment(url);
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn record_file_name(text_page_url: &str) -> String {
    format!("{}.json", last_path_segment(text_page_url))
}
