//! Rate-limited GitHub REST client.
//!
//! Every request goes through the shared [`RateBudget`] first (proactive
//! throttling) and then through the run's [`RetryPolicy`]. Responses are
//! classified into throttled, transient and permanent failures so callers
//! only ever see the crate error taxonomy.

use crate::budget::TimeBudget;
use crate::config::{GithubConfig, RetryConfig};
use crate::github::rate_budget::{instant_from_epoch, Acquire, RateBudget};
use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::RetryPolicy;
use reqwest::header::{HeaderMap, ACCEPT, LINK, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const API_VERSION: &str = "2022-11-28";
const MAX_ERROR_BODY: usize = 512;

/// One page of a paginated listing.
#[derive(Debug)]
pub struct Page {
    pub body: Value,
    /// `rel="next"` URL from the Link header
    pub next: Option<String>,
}

impl Page {
    /// Records of this page, unwrapping `items_field` for endpoints that wrap
    /// their array in an object.
    pub fn into_records(self, items_field: Option<&str>) -> Result<Vec<Value>> {
        let records = match items_field {
            Some(field) => self.body.get(field).cloned().unwrap_or(Value::Null),
            None => self.body,
        };
        match records {
            Value::Array(items) => Ok(items),
            other => Err(BackupError::Artifact(format!(
                "expected a JSON array{}, got {}",
                items_field.map(|f| format!(" under '{}'", f)).unwrap_or_default(),
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    per_page: u32,
    rate: Arc<RateBudget>,
    retry: RetryPolicy,
    budget: Arc<TimeBudget>,
}

impl ApiClient {
    pub fn new(
        github: &GithubConfig,
        retry: &RetryConfig,
        token: String,
        rate: Arc<RateBudget>,
        budget: Arc<TimeBudget>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(retry.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: github.api_url.trim_end_matches('/').to_string(),
            token,
            per_page: github.per_page,
            rate,
            retry: RetryPolicy::from_config(retry),
            budget,
        })
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn rate_budget(&self) -> &Arc<RateBudget> {
        &self.rate
    }

    /// Absolute URL for an API path, with the page size appended.
    pub fn endpoint(&self, path: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!(
            "{}/{}{}per_page={}",
            self.base_url,
            path.trim_start_matches('/'),
            separator,
            self.per_page
        )
    }

    /// Fetch one page, with proactive throttling and retries.
    pub async fn get_page(&self, url: &str) -> Result<Page> {
        self.retry
            .run("github_api", &self.budget, || async move {
                self.wait_for_slot().await?;
                self.send_once(url).await
            })
            .await
    }

    /// Follow `Link` pagination from `path` and collect every record.
    pub async fn paginate(&self, path: &str, items_field: Option<&str>) -> Result<Vec<Value>> {
        let mut url = self.endpoint(path);
        let mut records = Vec::new();

        loop {
            let page = self.get_page(&url).await?;
            let next = page.next.clone();
            let batch = page.into_records(items_field)?;
            let count = batch.len();
            records.extend(batch);

            match next {
                Some(next) if count >= self.per_page as usize && next != url => url = next,
                _ => break,
            }
        }

        Ok(records)
    }

    /// Block until the rate budget grants a slot. A window reset beyond the
    /// usable run time is reported as `RateLimited` instead of slept through.
    async fn wait_for_slot(&self) -> Result<()> {
        loop {
            match self.rate.try_acquire() {
                Acquire::Granted => return Ok(()),
                Acquire::WaitUntil(until) => {
                    let wait = until.saturating_duration_since(Instant::now());
                    info!(
                        wait_secs = wait.as_secs(),
                        remaining = ?self.rate.remaining(),
                        "Rate budget at low-water mark, waiting for window reset"
                    );
                    self.budget
                        .sleep_within(wait)
                        .await
                        .map_err(|_| BackupError::RateLimited { retry_after: Some(wait) })?;
                }
            }
        }
    }

    async fn send_once(&self, url: &str) -> Result<Page> {
        debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(USER_AGENT, concat!("org-backup/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let headers = response.headers();
        let remaining = header_number::<u32>(headers, "x-ratelimit-remaining");
        let reset_epoch = header_number::<u64>(headers, "x-ratelimit-reset");
        let retry_after = header_number::<u64>(headers, RETRY_AFTER.as_str()).map(Duration::from_secs);
        self.rate.observe(
            remaining,
            header_number::<u32>(headers, "x-ratelimit-limit"),
            reset_epoch,
        );

        if status.is_success() {
            let next = headers
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let body = response
                .json::<Value>()
                .await
                .map_err(|e| BackupError::TransientNetwork(format!("invalid response body: {}", e)))?;
            return Ok(Page { body, next });
        }

        let throttled = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && (remaining == Some(0) || retry_after.is_some()));
        if throttled {
            let wait = retry_after.or_else(|| {
                reset_epoch.map(|epoch| instant_from_epoch(epoch).saturating_duration_since(Instant::now()))
            });
            if let Some(wait) = wait {
                self.rate.mark_exhausted(Instant::now() + wait);
            }
            return Err(BackupError::RateLimited { retry_after: wait });
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }

        if status.is_server_error() {
            Err(BackupError::TransientNetwork(format!("{} from {}", status, url)))
        } else {
            Err(BackupError::Permanent {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn classify_transport_error(e: reqwest::Error) -> BackupError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        BackupError::TransientNetwork(e.to_string())
    } else {
        BackupError::Http(e)
    }
}

fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Extract the `rel="next"` target of a `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        if segments.any(|s| s.trim() == r#"rel="next""#) {
            target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .map(str::to_string)
        } else {
            None
        }
    })
}
