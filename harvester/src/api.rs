use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use secrecy::SecretString;
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub const FIRST_PAGE_NUMBER: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Rate limited (status {status:?})")]
    RateLimited { status: Option<u16>, quota: Option<Quota> },
    #[error("Request timed out")]
    Timeout,
    #[error("Requests kept timing out after rotating through all {0} credentials")]
    TimeoutsExhausted(usize),
    #[error("Malformed response for {resource} page {page}")]
    MalformedResponse { resource: String, page: u32 },
    #[error("Unexpected status {status} for {resource} page {page}")]
    UnexpectedStatus { status: u16, resource: String, page: u32 },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Bucket count mismatch: expected {expected}, found {found}")]
    BucketMismatch { expected: usize, found: usize },
    #[error("No usable API credentials")]
    NoCredentials,
    #[error("Stored progress of run {0} disappeared during the run")]
    ProgressLost(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors resolved by rotating credentials and retrying, never surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RateLimited { .. } | Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Quota snapshot reported by the remote API for one credential.
#[derive(Constructor, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which `remaining` is restored to `limit`.
    pub reset: i64,
}

/// Handle to one pooled access token.
///
/// `remaining` is the quota the pool knew about when the handle was issued;
/// the authoritative value comes back with every response.
#[derive(Clone, Constructor)]
pub struct Credential {
    id: usize,
    token: Arc<SecretString>,
    remaining: u32,
}

impl Credential {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

/// Optional `[since, until)` filter passed along with a page request.
#[derive(Constructor, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Constructor, Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource: String,
    pub page: u32,
    pub per_page: u32,
    pub window: Option<TimeWindow>,
}

#[derive(Constructor, Debug)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    /// Last page number, when the response carried pagination metadata.
    pub total_pages: Option<u32>,
    pub quota: Option<Quota>,
}

impl<T> PageResult<T> {
    /// A missing resource: no items and nothing more to fetch.
    pub fn not_found(quota: Option<Quota>) -> Self {
        PageResult::new(Vec::new(), None, quota)
    }

    /// Converts the items, dropping those `convert` rejects; pagination and quota are kept.
    pub fn filter_map<U, C>(self, convert: C) -> PageResult<U>
    where
        C: FnMut(T) -> Option<U>,
    {
        PageResult::new(self.items.into_iter().filter_map(convert).collect(), self.total_pages, self.quota)
    }
}

/// One commit-like event.
#[derive(Constructor, Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    /// `None` when the actor could not be resolved to an account upstream.
    pub identity: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OwnerKind {
    Organization,
    User,
}

#[derive(Constructor, Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    /// `owner/name`
    pub full_name: String,
    pub fork: bool,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
}

/// Lines added and removed during one week.
#[derive(Constructor, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyChurn {
    /// Unix timestamp of the week start.
    pub week: i64,
    pub additions: u64,
    pub deletions: u64,
}

impl WeeklyChurn {
    pub fn changed_lines(&self) -> u64 {
        self.additions + self.deletions
    }
}

/// Fetches one page of a paginated resource.
///
/// Implementations report a missing resource as an empty `PageResult`,
/// quota exhaustion and server faults as `Error::RateLimited`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    type Item: Send;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<Self::Item>>;
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Liveness probe: current core quota of `token`.
    async fn rate_limit(&self, token: &SecretString) -> Result<Quota>;

    /// Probes whether `owner` is an organization or a plain user account.
    async fn owner_kind(&self, credential: &Credential, owner: &str) -> Result<OwnerKind>;
}
