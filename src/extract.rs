use std::sync::LazyLock;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::config::HttpConfig;
use crate::formats::{Book, BookPages, Narrator, UNKNOWN};

/// Page fetch + field extraction for one book.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// `Ok(None)` when either page cannot be retrieved; no record is produced.
    async fn extract(&self, pages: &BookPages) -> anyhow::Result<Option<Book>>;

    /// Download URLs of every audio part listed on the audio page, in order.
    async fn resolve_audio_parts(&self, audio_page_url: &str) -> anyhow::Result<Vec<String>>;
}

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<div[^>]*class="[^"]*\bdata\b[^"]*"[^>]*>.*?<h1[^>]*>(.*?)</h1>"#)
        .expect("title regex")
});
static AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<span[^>]*class="[^"]*\btext-brand\b[^"]*"[^>]*>(.*?)</span>"#)
        .expect("author regex")
});
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<[a-z0-9]+[^>]*class="[^"]*\bfeatu\b[^"]*"[^>]*>(.*?)</[a-z0-9]+>"#)
        .expect("duration regex")
});
static NARRATOR_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<i[^>]*class="[^"]*\bfa-microphone\b[^"]*"[^>]*>\s*</i>(.*?)(?:<br\s*/?>|</(?:p|div|span|li)>)"#)
        .expect("narrator block regex")
});
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b([^>]*)>(.*?)</a>"#).expect("anchor regex")
});
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']*)["']"#).expect("href regex")
});
static AUDIO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:https?:)?//[^\s"'<>]+?\.mp3(?:\?[^\s"'<>]*)?"#).expect("audio url regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

const TEXT_DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "epub", "txt"];

#[derive(Debug, Clone)]
pub struct HtmlMetadataExtractor {
    client: reqwest::Client,
    user_agent: String,
}

impl HtmlMetadataExtractor {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    pub fn from_config(config: &HttpConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            crate::fetch::build_http_client(config)?,
            &config.user_agent,
        ))
    }

    /// `Ok(None)` for unreachable pages and non-success statuses.
    async fn fetch_page(&self, url: &str) -> anyhow::Result<Option<String>> {
        let response = match self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(url, error = %err, "page unreachable");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            tracing::warn!(url, status = %response.status(), "page rejected");
            return Ok(None);
        }

        let html = response
            .text()
            .await
            .with_context(|| format!("read page body: {url}"))?;
        Ok(Some(html))
    }
}

#[async_trait]
impl MetadataExtractor for HtmlMetadataExtractor {
    async fn extract(&self, pages: &BookPages) -> anyhow::Result<Option<Book>> {
        let Some(text_html) = self.fetch_page(&pages.text_page_url).await? else {
            return Ok(None);
        };
        let Some(audio_html) = self.fetch_page(&pages.audio_page_url).await? else {
            return Ok(None);
        };

        let text_download_url = find_text_download_url(&text_html, &pages.text_page_url);
        let audio_download_urls = find_audio_urls(&audio_html, &pages.audio_page_url);

        Ok(Some(Book {
            name: first_capture_text(&TITLE_RE, &audio_html),
            author: first_capture_text(&AUTHOR_RE, &text_html),
            duration: first_capture_text(&DURATION_RE, &audio_html),
            narrators: parse_narrators(&audio_html, &pages.audio_page_url),
            text_url: pages.text_page_url.clone(),
            audio_url: pages.audio_page_url.clone(),
            text_download_url,
            audio_download_urls,
            fetched_at: Some(chrono::Utc::now().to_rfc3339()),
        }))
    }

    async fn resolve_audio_parts(&self, audio_page_url: &str) -> anyhow::Result<Vec<String>> {
        let html = self
            .fetch_page(audio_page_url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("audio page unavailable: {audio_page_url}"))?;
        Ok(find_audio_urls(&html, audio_page_url))
    }
}

fn first_capture_text(re: &Regex, html: &str) -> String {
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| inner_text(m.as_str()))
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_owned())
}

fn inner_text(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn resolve_link(base: &str, href: &str) -> Option<String> {
    let href = decode_entities(href.trim());
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(&href).ok().map(|url| url.to_string()),
        Err(_) => Some(href),
    }
}

fn parse_narrators(audio_html: &str, audio_page_url: &str) -> Vec<Narrator> {
    let mut narrators = Vec::new();
    if let Some(block) = NARRATOR_BLOCK_RE
        .captures(audio_html)
        .and_then(|caps| caps.get(1))
    {
        for anchor in ANCHOR_RE.captures_iter(block.as_str()) {
            let name = inner_text(anchor.get(2).map_or("", |m| m.as_str()));
            let url = anchor
                .get(1)
                .and_then(|attrs| HREF_RE.captures(attrs.as_str()))
                .and_then(|caps| caps.get(1))
                .and_then(|href| resolve_link(audio_page_url, href.as_str()));
            narrators.push(Narrator {
                name: if name.is_empty() { UNKNOWN.to_owned() } else { name },
                url: url.unwrap_or_else(|| UNKNOWN.to_owned()),
            });
        }
    }
    if narrators.is_empty() {
        narrators.push(Narrator::unknown());
    }
    narrators
}

fn find_text_download_url(text_html: &str, text_page_url: &str) -> Option<String> {
    HREF_RE
        .captures_iter(text_html)
        .filter_map(|caps| caps.get(1))
        .filter_map(|href| resolve_link(text_page_url, href.as_str()))
        .find(|link| {
            crate::formats::url_extension(link)
                .is_some_and(|ext| TEXT_DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
        })
}

fn find_audio_urls(audio_html: &str, audio_page_url: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for found in AUDIO_URL_RE.find_iter(audio_html) {
        let Some(url) = resolve_link(audio_page_url, found.as_str()) else {
            continue;
        };
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}
