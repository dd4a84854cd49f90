use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
    pub http: HttpConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub metadata_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub url_list_path: PathBuf,
    pub text_dir: PathBuf,
    pub audio_raw_dir: PathBuf,
    pub audio_qualified_dir: PathBuf,
    pub audio_unqualified_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            metadata_dir: data.join("metadata").join("books"),
            ledger_path: data.join("metadata").join("books.jsonl"),
            url_list_path: data.join("audiobook_urls.txt"),
            text_dir: data.join("text").join("raw"),
            audio_raw_dir: data.join("audio").join("raw"),
            audio_qualified_dir: data.join("audio").join("qualified"),
            audio_unqualified_dir: data.join("audio").join("unqualified"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on concurrent metadata extractions.
    pub metadata_fetch_limit: usize,
    /// Upper bound on books downloading at once; a book's files share its slot.
    pub download_book_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            metadata_fetch_limit: 16,
            download_book_limit: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Prefix joined with an audio-page slug to form the text-page URL.
    pub text_base_url: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("audiobook-harvest/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 600,
            text_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionFailurePolicy {
    /// Any failed part fails the whole book; nothing is concatenated.
    #[default]
    FailGroup,
    /// Concatenate the parts that converted and record the gap.
    SkipPart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub min_sample_rate: u32,
    pub source_extension: String,
    pub target_extension: String,
    pub ffmpeg_bin: String,
    pub on_conversion_failure: ConversionFailurePolicy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            min_sample_rate: 44_100,
            source_extension: "mp3".to_owned(),
            target_extension: "wav".to_owned(),
            ffmpeg_bin: "ffmpeg".to_owned(),
            on_conversion_failure: ConversionFailurePolicy::FailGroup,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the YAML file (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_yaml::from_str(&yaml)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(bin) = std::env::var("AUDIOBOOK_HARVEST_FFMPEG")
            && !bin.trim().is_empty()
        {
            self.audio.ffmpeg_bin = bin.trim().to_owned();
        }
        if let Ok(user_agent) = std::env::var("AUDIOBOOK_HARVEST_USER_AGENT")
            && !user_agent.trim().is_empty()
        {
            self.http.user_agent = user_agent.trim().to_owned();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.metadata_fetch_limit == 0 {
            anyhow::bail!("limits.metadata_fetch_limit must be >= 1");
        }
        if self.limits.download_book_limit == 0 {
            anyhow::bail!("limits.download_book_limit must be >= 1");
        }
        if self.audio.source_extension.trim().is_empty()
            || self.audio.target_extension.trim().is_empty()
        {
            anyhow::bail!("audio extensions must not be empty");
        }
        if self.paths.audio_qualified_dir == self.paths.audio_unqualified_dir {
            anyhow::bail!(
                "qualified and unqualified audio roots must differ: {}",
                self.paths.audio_qualified_dir.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() -> anyhow::Result<()> {
        let yaml = r#"
limits:
  download_book_limit: 2
audio:
  min_sample_rate: 22050
  on_conversion_failure: skip_part
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        assert_eq!(config.limits.download_book_limit, 2);
        assert_eq!(config.limits.metadata_fetch_limit, 16);
        assert_eq!(config.audio.min_sample_rate, 22_050);
        assert_eq!(
            config.audio.on_conversion_failure,
            ConversionFailurePolicy::SkipPart
        );
        assert_eq!(config.audio.source_extension, "mp3");
        config.validate()?;
        Ok(())
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = PipelineConfig::default();
        config.limits.download_book_limit = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("download_book_limit"));
    }

    #[test]
    fn shared_audio_roots_are_rejected() {
        let mut config = PipelineConfig::default();
        config.paths.audio_unqualified_dir = config.paths.audio_qualified_dir.clone();
        assert!(config.validate().is_err());
    }
}
