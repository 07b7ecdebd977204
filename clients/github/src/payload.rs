use chrono::{DateTime, Utc};
use harvester::api::{ActivityRecord, Quota, RepoSummary, WeeklyChurn};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Commit {
    /// Missing when the commit email is not linked to an account.
    pub author: Option<Account>,
    pub commit: CommitDetail,
}

#[derive(Deserialize, Debug)]
pub struct Account {
    pub login: String,
}

#[derive(Deserialize, Debug)]
pub struct CommitDetail {
    pub author: Option<Signature>,
}

#[derive(Deserialize, Debug)]
pub struct Signature {
    pub date: DateTime<Utc>,
}

impl Commit {
    /// Commits without an author date cannot be placed in time and are dropped.
    pub fn into_record(self) -> Option<ActivityRecord> {
        let date = self.commit.author?.date;
        Some(ActivityRecord::new(self.author.map(|account| account.login), date))
    }
}

#[derive(Deserialize, Debug)]
pub struct Repo {
    pub full_name: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub watchers_count: u64,
}

impl From<Repo> for RepoSummary {
    fn from(repo: Repo) -> Self {
        RepoSummary::new(
            repo.full_name,
            repo.fork,
            repo.stargazers_count,
            repo.forks_count,
            repo.watchers_count,
        )
    }
}

#[derive(Deserialize, Debug)]
pub struct Release {
    pub tag_name: String,
}

/// `[week, additions, deletions]`, deletions negative.
#[derive(Deserialize, Debug)]
pub struct CodeFrequency(pub i64, pub i64, pub i64);

impl From<CodeFrequency> for WeeklyChurn {
    fn from(CodeFrequency(week, additions, deletions): CodeFrequency) -> Self {
        WeeklyChurn::new(week, additions.unsigned_abs(), deletions.unsigned_abs())
    }
}

/// Weekly commit counts of the last 52 weeks, oldest first.
#[derive(Deserialize, Debug)]
pub struct Participation {
    pub all: Vec<u64>,
}

#[derive(Deserialize, Debug)]
pub struct ContributorStats {
    pub author: Option<Account>,
}

#[derive(Deserialize, Debug)]
pub struct RateLimitBody {
    pub resources: RateLimitResources,
}

#[derive(Deserialize, Debug)]
pub struct RateLimitResources {
    pub core: RateLimitResource,
}

#[derive(Deserialize, Debug)]
pub struct RateLimitResource {
    pub limit: u32,
    pub remaining: u32,
    pub reset: i64,
}

impl From<RateLimitResource> for Quota {
    fn from(resource: RateLimitResource) -> Self {
        Quota::new(resource.limit, resource.remaining, resource.reset)
    }
}
