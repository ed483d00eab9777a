use std::time::Duration;

use reqwest::Response;
use url::Url;

use crate::error::{Result, SyncError};

use super::listing::parse_listing;
use super::types::{Listing, ListingRules};

/// Timeouts for talking to the card.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Whole-request bound for a listing page.
    pub listing_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest pause allowed between two chunks of a file body.
    pub download_idle_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            listing_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            download_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP access to the card's web server.
pub struct EzShareClient {
    http: reqwest::Client,
    options: ClientOptions,
}

impl EzShareClient {
    pub fn new(options: ClientOptions) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self { http, options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// GET and parse one directory listing.
    pub async fn list_dir(&self, url: &Url, rules: &ListingRules) -> Result<Listing> {
        let fetch_err = |e: reqwest::Error| SyncError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self
            .http
            .get(url.clone())
            .timeout(self.options.listing_timeout)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(fetch_err)?;

        let body = resp.text().await.map_err(fetch_err)?;
        let listing = parse_listing(&body, url.as_str(), rules)?;

        tracing::debug!(
            url = %url,
            files = listing.files.len(),
            dirs = listing.dirs.len(),
            "listed directory"
        );
        Ok(listing)
    }

    /// Start a streamed GET for a file body. Only the status line and
    /// headers have been received when this returns.
    ///
    /// Waiting for the headers is bounded by the same idle timeout that
    /// applies between body chunks.
    pub async fn open_download(&self, url: &Url) -> Result<Response> {
        let transport_err = |reason: String| SyncError::Transport {
            url: url.to_string(),
            reason,
        };
        let idle = self.options.download_idle_timeout;

        tokio::time::timeout(idle, self.http.get(url.clone()).send())
            .await
            .map_err(|_| transport_err(format!("no response within {idle:?}")))?
            .and_then(Response::error_for_status)
            .map_err(|e| transport_err(e.to_string()))
    }
}

/// URL of a file's body: `download?<query>` relative to its directory.
pub fn download_url(dir_url: &Url, query: &str) -> Result<Url> {
    join(dir_url, &format!("download?{query}"))
}

/// Absolute URL of a subdirectory listing.
pub fn subdir_url(dir_url: &Url, href: &str) -> Result<Url> {
    join(dir_url, href)
}

fn join(base: &Url, relative: &str) -> Result<Url> {
    base.join(relative).map_err(|source| SyncError::InvalidUrl {
        url: relative.to_string(),
        source,
    })
}
