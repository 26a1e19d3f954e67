use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const API_BASE: &str = "https://api.github.com";
const DOWNLOAD_BASE: &str = "https://github.com";

/// Release-index failures. `NotFound` (nothing published, no matching asset)
/// and `Network` (transport fault) stay distinct: the update controller stops
/// for one and retries later for the other, and collapsing them here would
/// erase that decision.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("no release or asset published")]
    NotFound,
    #[error("release index request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("release index returned HTTP {0}")]
    Http(u16),
    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What the update controller needs from a release host. Implemented by
/// [`ReleaseClient`] for GitHub and by scripted fakes in tests.
#[allow(async_fn_in_trait)]
pub trait ReleaseSource {
    /// Latest published version string, leading `v` stripped.
    async fn latest_version(&self) -> Result<String, ReleaseError>;

    /// Fetch the named asset of `version` into `dest`, returning the byte
    /// count written.
    async fn download_to(
        &self,
        version: &str,
        asset_name: &str,
        dest: &Path,
    ) -> Result<u64, ReleaseError>;
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// GitHub release-index client. Every request carries the configured timeout
/// so a hanging remote cannot starve the sampling loop, plus an optional
/// bearer credential for private repositories.
pub struct ReleaseClient {
    http: reqwest::Client,
    repo: String,
    timeout: Duration,
    token: Option<String>,
}

impl ReleaseClient {
    pub fn new(http: reqwest::Client, repo: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            repo: repo.into(),
            timeout,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github.v3+json")
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

impl ReleaseSource for ReleaseClient {
    async fn latest_version(&self) -> Result<String, ReleaseError> {
        let url = format!("{API_BASE}/repos/{}/releases/latest", self.repo);
        let response = self.request(&url).send().await?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        let release: LatestRelease = response.json().await?;
        Ok(strip_tag_prefix(&release.tag_name).to_string())
    }

    async fn download_to(
        &self,
        version: &str,
        asset_name: &str,
        dest: &Path,
    ) -> Result<u64, ReleaseError> {
        let url = format!(
            "{DOWNLOAD_BASE}/{}/releases/download/v{version}/{asset_name}",
            self.repo
        );
        let mut response = self.request(&url).send().await?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0_u64;
        while let Some(chunk) = response.chunk().await? {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as u64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(written)
    }
}

/// Map an unsuccessful status onto the error taxonomy; a 404 means "nothing
/// published for this repo or platform", everything else non-2xx is a plain
/// HTTP failure.
fn status_error(status: StatusCode) -> Option<ReleaseError> {
    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND {
        Some(ReleaseError::NotFound)
    } else {
        Some(ReleaseError::Http(status.as_u16()))
    }
}

fn strip_tag_prefix(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}
