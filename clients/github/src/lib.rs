//! GitHub REST API implementation of the harvester client traits.

mod builder;
mod headers;
mod payload;

use async_trait::async_trait;
use chrono::SecondsFormat;
use derive_more::Constructor;
use harvester::api::{
    ActivityRecord, Client, Credential, Error, OwnerKind, PageFetcher, PageRequest, PageResult, Quota, RepoSummary,
    Result, WeeklyChurn, FIRST_PAGE_NUMBER,
};
use log::debug;
use reqwest::header::{self, HeaderValue};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use builder::{GithubClientBuilder, GITHUB_URL};

use crate::headers::{read_last_page, read_quota};
use crate::payload::{CodeFrequency, Commit, ContributorStats, Participation, RateLimitBody, Release, Repo};

#[derive(Clone, Constructor)]
pub struct GithubClient {
    client: reqwest::Client,
    github_url: String,
}

impl GithubClient {
    fn get(&self, token: &SecretString, path: &str) -> Result<RequestBuilder> {
        let mut auth = HeaderValue::from_str(&format!("token {}", token.expose_secret())).map_err(anyhow::Error::from)?;
        auth.set_sensitive(true);
        Ok(self
            .client
            .get(format!("{}/{}", self.github_url, path))
            .header(header::AUTHORIZATION, auth))
    }

    /// One page of a list endpoint.
    ///
    /// A missing resource, or a first page that is not a list, is an empty result.
    /// 403, 429 and server errors are `RateLimited`.
    async fn get_page<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        request: &PageRequest,
    ) -> Result<PageResult<T>> {
        let raw = self.get_json(credential, path, request).await?;
        match raw.body {
            None => Ok(PageResult::not_found(raw.quota)),
            Some(Value::Array(items)) => {
                let items = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<Vec<T>, _>>()
                    .map_err(|_| malformed(request))?;
                Ok(PageResult::new(items, raw.total_pages, raw.quota))
            }
            Some(_) if request.page == FIRST_PAGE_NUMBER => {
                debug!("{} answered with something other than a list", path);
                Ok(PageResult::not_found(raw.quota))
            }
            Some(_) => Err(malformed(request)),
        }
    }

    /// A single JSON document, `None` when it is missing or not shaped like `T`.
    async fn get_document<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        request: &PageRequest,
    ) -> Result<(Option<T>, Option<Quota>)> {
        let raw = self.get_json(credential, path, request).await?;
        let document = match raw.body.map(serde_json::from_value::<T>) {
            Some(Ok(document)) => Some(document),
            Some(Err(err)) if request.page == FIRST_PAGE_NUMBER => {
                debug!("{} not usable yet: {}", path, err);
                None
            }
            Some(Err(_)) => return Err(malformed(request)),
            None => None,
        };
        Ok((document, raw.quota))
    }

    async fn get_json(&self, credential: &Credential, path: &str, request: &PageRequest) -> Result<RawPage> {
        let mut query = vec![
            ("per_page", request.per_page.to_string()),
            ("page", request.page.to_string()),
        ];
        if let Some(window) = request.window {
            query.push(("since", window.since.to_rfc3339_opts(SecondsFormat::Secs, true)));
            if let Some(until) = window.until {
                query.push(("until", until.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
        }
        let response = send(self.get(credential.token(), path)?.query(&query)).await?;
        let status = response.status();
        let quota = read_quota(response.headers());
        let first_page = request.page == FIRST_PAGE_NUMBER;
        if is_missing(status) && first_page {
            debug!("{} not found ({})", path, status);
            return Ok(RawPage {
                body: None,
                total_pages: None,
                quota,
            });
        }
        if !status.is_success() {
            return Err(rejection(status, quota, &request.resource, request.page));
        }

        let total_pages = read_last_page(response.headers());
        let body = response.bytes().await.map_err(transport_error)?;
        let body = match serde_json::from_slice::<Value>(&body) {
            Ok(body) => Some(body),
            // 204 on an empty repository
            Err(_) if first_page => None,
            Err(_) => return Err(malformed(request)),
        };
        Ok(RawPage {
            body,
            total_pages,
            quota,
        })
    }
}

/// Successful response before it is shaped into items. No body means nothing to read.
struct RawPage {
    body: Option<Value>,
    total_pages: Option<u32>,
    quota: Option<Quota>,
}

#[async_trait]
impl Client for GithubClient {
    async fn rate_limit(&self, token: &SecretString) -> Result<Quota> {
        let response = send(self.get(token, "rate_limit")?).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(rejection(status, read_quota(response.headers()), "rate_limit", FIRST_PAGE_NUMBER));
        }
        let body = response.json::<RateLimitBody>().await.map_err(|_| Error::MalformedResponse {
            resource: "rate_limit".to_string(),
            page: FIRST_PAGE_NUMBER,
        })?;
        Ok(body.resources.core.into())
    }

    async fn owner_kind(&self, credential: &Credential, owner: &str) -> Result<OwnerKind> {
        let response = send(self.get(credential.token(), &format!("orgs/{}", owner))?).await?;
        match response.status() {
            StatusCode::OK => Ok(OwnerKind::Organization),
            StatusCode::NOT_FOUND => Ok(OwnerKind::User),
            status => Err(rejection(status, read_quota(response.headers()), owner, FIRST_PAGE_NUMBER)),
        }
    }
}

/// Commits of the `owner/name` repository in `resource`, filtered by the request window.
#[derive(Clone, Constructor)]
pub struct CommitPages {
    client: GithubClient,
}

#[async_trait]
impl PageFetcher for CommitPages {
    type Item = ActivityRecord;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<ActivityRecord>> {
        let path = format!("repos/{}/commits", request.resource);
        let page = self.client.get_page::<Commit>(credential, &path, request).await?;
        Ok(page.filter_map(Commit::into_record))
    }
}

/// Repositories owned by the organization or user in `resource`.
#[derive(Clone, Constructor)]
pub struct OwnerRepoPages {
    client: GithubClient,
    kind: OwnerKind,
}

#[async_trait]
impl PageFetcher for OwnerRepoPages {
    type Item = RepoSummary;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<RepoSummary>> {
        let path = match self.kind {
            OwnerKind::Organization => format!("orgs/{}/repos", request.resource),
            OwnerKind::User => format!("users/{}/repos", request.resource),
        };
        let page = self.client.get_page::<Repo>(credential, &path, request).await?;
        Ok(page.filter_map(|repo| Some(repo.into())))
    }
}

/// Release tags of the `owner/name` repository in `resource`.
#[derive(Clone, Constructor)]
pub struct ReleasePages {
    client: GithubClient,
}

#[async_trait]
impl PageFetcher for ReleasePages {
    type Item = String;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<String>> {
        let path = format!("repos/{}/releases", request.resource);
        let page = self.client.get_page::<Release>(credential, &path, request).await?;
        Ok(page.filter_map(|release| Some(release.tag_name)))
    }
}

/// Weekly line changes of the `owner/name` repository in `resource`, oldest week first.
///
/// GitHub answers `202 Accepted` with an empty object while the statistics are being computed,
/// which reads as no data.
#[derive(Clone, Constructor)]
pub struct CodeFrequencyPages {
    client: GithubClient,
}

#[async_trait]
impl PageFetcher for CodeFrequencyPages {
    type Item = WeeklyChurn;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<WeeklyChurn>> {
        let path = format!("repos/{}/stats/code_frequency", request.resource);
        let page = self.client.get_page::<CodeFrequency>(credential, &path, request).await?;
        Ok(page.filter_map(|week| Some(week.into())))
    }
}

/// Commits per week over the last year of the `owner/name` repository in `resource`, oldest week first.
///
/// Served as a single document, so there is only ever one page.
#[derive(Clone, Constructor)]
pub struct ParticipationPages {
    client: GithubClient,
}

#[async_trait]
impl PageFetcher for ParticipationPages {
    type Item = u64;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<u64>> {
        let path = format!("repos/{}/stats/participation", request.resource);
        match self.client.get_document::<Participation>(credential, &path, request).await? {
            (Some(participation), quota) => Ok(PageResult::new(participation.all, None, quota)),
            (None, quota) => Ok(PageResult::not_found(quota)),
        }
    }
}

/// Logins of the contributors of the `owner/name` repository in `resource`.
#[derive(Clone, Constructor)]
pub struct ContributorPages {
    client: GithubClient,
}

#[async_trait]
impl PageFetcher for ContributorPages {
    type Item = String;

    async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<String>> {
        let path = format!("repos/{}/stats/contributors", request.resource);
        let page = self.client.get_page::<ContributorStats>(credential, &path, request).await?;
        Ok(page.filter_map(|contributor| contributor.author.map(|account| account.login)))
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    request.send().await.map_err(transport_error)
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::Transport(err.to_string())
    }
}

fn malformed(request: &PageRequest) -> Error {
    Error::MalformedResponse {
        resource: request.resource.clone(),
        page: request.page,
    }
}

fn is_missing(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
    )
}

fn rejection(status: StatusCode, quota: Option<Quota>, resource: &str, page: u32) -> Error {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::RateLimited {
            status: Some(status.as_u16()),
            quota,
        }
    } else {
        Error::UnexpectedStatus {
            status: status.as_u16(),
            resource: resource.to_string(),
            page,
        }
    }
}
