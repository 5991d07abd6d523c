//! REST calls to the Passport Buddy backend, routed through the request queue.
//!
//! Also home to the caller-side policy the queue itself stays out of: turning
//! `reqwest` failures into an [`ErrorKind`] and turning queue rejections into
//! something to show the user.

use std::error::Error as StdError;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{ErrorKind, OperationError, QueueError};
use crate::queue::{Pending, RequestQueue};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Decide whether a failed HTTP call is worth retrying.
///
/// Transient: a server error status, a connection reset anywhere in the
/// error chain, or a request that never got a response (connect failure,
/// timeout). Everything else, including 4xx and undecodable bodies, is
/// permanent.
pub fn classify(err: &reqwest::Error) -> ErrorKind {
    if let Some(status) = err.status() {
        return if status.is_server_error() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
    }
    if is_connection_reset(err) {
        return ErrorKind::Transient;
    }
    if err.is_connect() || err.is_timeout() || err.is_request() {
        return ErrorKind::Transient;
    }
    ErrorKind::Permanent
}

/// Walk the source chain looking for `ECONNRESET`.
pub fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        current = e.source();
    }
    false
}

impl From<reqwest::Error> for OperationError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify(&err);
        OperationError::new(kind, err)
    }
}

// ---------------------------------------------------------------------------
// User notices
// ---------------------------------------------------------------------------

/// What to tell the user when a queued action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    TooFast,
    Failed,
}

impl Notice {
    pub fn for_error(err: &QueueError) -> Self {
        match err.kind() {
            ErrorKind::RateLimit => Notice::TooFast,
            ErrorKind::Transient | ErrorKind::Permanent => Notice::Failed,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Notice::TooFast => "You're doing that too fast. Please wait a moment.",
            Notice::Failed => "Something went wrong. Please try again.",
        }
    }
}

// ---------------------------------------------------------------------------
// BackendClient
// ---------------------------------------------------------------------------

/// Like state returned by the backend after a toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeStatus {
    pub liked: bool,
    pub likes: u64,
}

/// HTTP client for the backend REST endpoints. Every call goes through the
/// shared [`RequestQueue`].
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    queue: RequestQueue,
}

impl BackendClient {
    pub fn new(config: &BackendConfig, queue: RequestQueue) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid backend base_url: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("backend base_url cannot carry a path: {}", config.base_url);
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url,
            queue,
        })
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Rate-limit bucket for likes on one post.
    pub fn like_key(post_id: &str) -> String {
        format!("like-{}", post_id)
    }

    /// `POST /api/posts/{post_id}/like`, rate limited per post.
    pub fn toggle_like(&self, post_id: &str) -> Pending<LikeStatus> {
        let url = self.endpoint(&["api", "posts", post_id, "like"]);
        let key = Self::like_key(post_id);
        let http = self.http.clone();
        self.queue.add(
            move || {
                let request = http.post(url.clone());
                async move {
                    let status = request
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<LikeStatus>()
                        .await?;
                    Ok::<_, OperationError>(status)
                }
            },
            Some(key.as_str()),
        )
    }

    /// Append percent-encoded `segments` to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejected cannot-be-a-base URLs, so this always succeeds.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}
