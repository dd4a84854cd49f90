use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::USER_AGENT;
use tokio::io::AsyncWriteExt as _;

use crate::config::HttpConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url} answered {status}")]
    Rejected { url: String, status: StatusCode },

    #[error("{url} is unreachable: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("transfer of {url} failed: {source}")]
    Transfer {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Moves one remote asset onto local disk.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Checks that `url` answers with a success status without transferring the body.
    async fn probe(&self, url: &str) -> Result<(), FetchError>;

    /// Probes `url`, then writes its body to `dest`. Returns the byte count.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

pub fn build_http_client(config: &HttpConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .connect_timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .context("build http client")
}

#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpAssetFetcher {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    pub fn from_config(config: &HttpConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_http_client(config)?, &config.user_agent))
    }

    async fn transfer(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let io_err = |source| FetchError::Io {
            path: dest.display().to_string(),
            source,
        };

        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|source| FetchError::Unreachable {
                url: url.to_owned(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Rejected {
                url: url.to_owned(),
                status: response.status(),
            });
        }

        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;

        let mut written = 0_u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| FetchError::Transfer {
                url: url.to_owned(),
                source,
            })?
        {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        Ok(written)
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn probe(&self, url: &str) -> Result<(), FetchError> {
        let response = self
            .client
            .head(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|source| FetchError::Unreachable {
                url: url.to_owned(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Rejected {
                url: url.to_owned(),
                status: response.status(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.probe(url).await?;

        match self.transfer(url, dest).await {
            Ok(written) => {
                tracing::debug!(url, path = %dest.display(), bytes = written, "fetched");
                Ok(written)
            }
            Err(err) => {
                // Interrupted transfers are discarded, never resumed.
                if let Err(remove_err) = tokio::fs::remove_file(dest).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %dest.display(), error = %remove_err, "remove partial file");
                }
                Err(err)
            }
        }
    }
}
