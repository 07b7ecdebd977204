mod args;
mod history;
mod manifest;

use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::sync::Arc;

use harvester::api::{RepoSummary, Result, WeeklyChurn};
use harvester::buckets::{AggregateState, BucketWidth};
use harvester::config::HarvestConfig;
use harvester::directory::{own_repositories, resolve_owner};
use harvester::{BatchScheduler, CredentialPool, HarvestOrchestrator, HarvestReport, ProgressLedger};
use github_client::{
    CodeFrequencyPages, CommitPages, ContributorPages, GithubClient, GithubClientBuilder, OwnerRepoPages,
    ParticipationPages, ReleasePages,
};
use log::info;

pub use args::{Args, Command};
pub use history::ActivityHistory;
pub use manifest::Manifest;

use crate::manifest::push_unique;

/// Most recent weeks summed into `RepoStats::churn` and `RepoStats::commits`.
pub const RECENT_WEEKS: usize = 4;

/// Harvests contributor activity of every repository the manifest names, resuming the run if it was interrupted.
pub async fn harvest_contributors(args: &Args) -> Result<HarvestReport> {
    let manifest = Manifest::load(&args.manifest)?;
    let session = Session::connect(args).await?;
    let mut repos = own_repositories(&session.owner_repositories(&manifest.owners()).await?);
    for repo in manifest.repositories() {
        push_unique(&mut repos, repo);
    }
    info!("{} repositories to harvest", repos.len());

    let scheduler = BatchScheduler::new(
        CommitPages::new(session.client.clone()),
        session.pool.clone(),
        &session.config,
    );
    let ledger = ProgressLedger::new(&args.state_dir, session.config.bucket_count());
    let orchestrator = HarvestOrchestrator::new(scheduler, ledger, &session.config);
    orchestrator.run(&args.run_id(), &repos).await
}

/// Popularity and activity of the non-fork repositories of the manifest's organizations.
pub async fn repository_stats(args: &Args) -> Result<StatsReport> {
    let manifest = Manifest::load(&args.manifest)?;
    let session = Session::connect(args).await?;
    let listing = session.owner_repositories(&manifest.owners()).await?;
    let releases = BatchScheduler::new(
        ReleasePages::new(session.client.clone()),
        session.pool.clone(),
        &session.config,
    );
    let code_frequency = BatchScheduler::new(
        CodeFrequencyPages::new(session.client.clone()),
        session.pool.clone(),
        &session.config,
    );
    let participation = BatchScheduler::new(
        ParticipationPages::new(session.client.clone()),
        session.pool.clone(),
        &session.config,
    );
    let contributors = BatchScheduler::new(
        ContributorPages::new(session.client.clone()),
        session.pool.clone(),
        &session.config,
    );

    let mut report = StatsReport::default();
    for repo in listing.iter().filter(|repo| !repo.fork) {
        let weekly_churn = code_frequency.fetch_all(&repo.full_name, None).await?;
        let weekly_commits = participation.fetch_all(&repo.full_name, None).await?;
        let mut repo_stats = RepoStats::from(repo);
        repo_stats.releases = releases.fetch_all(&repo.full_name, None).await?.len() as u64;
        repo_stats.contributors = contributors.fetch_all(&repo.full_name, None).await?.len() as u64;
        repo_stats.churn = recent_churn(&weekly_churn);
        repo_stats.commits = recent_commits(&weekly_commits);
        info!("{}: {}", repo.full_name, repo_stats);
        report.totals += repo_stats;
        report.history.add(&weekly_churn, &weekly_commits);
    }
    Ok(report)
}

/// One line per bucket, oldest first: distinct contributors, commits and, with `detail`, their names.
/// A last line counts every contributor once over the whole window.
pub fn render_buckets(state: &AggregateState, width: BucketWidth, detail: bool) -> Vec<String> {
    let label = match width {
        BucketWidth::Weekly => "Week",
        BucketWidth::Monthly => "Month",
    };
    let mut lines: Vec<String> = state
        .buckets()
        .iter()
        .enumerate()
        .map(|(index, bucket)| {
            let mut line = format!(
                "{} {}: {} contributors, {} commits",
                label,
                index + 1,
                bucket.identities.len(),
                bucket.commits
            );
            if detail && !bucket.identities.is_empty() {
                let names: Vec<&str> = bucket.identities.iter().map(String::as_str).collect();
                line.push_str(&format!(" ({})", names.join(", ")));
            }
            line
        })
        .collect();
    lines.push(format!(
        "Total: {} contributors, {} commits",
        state.distinct_identities().len(),
        state.total_commits()
    ));
    lines
}

/// Lines changed during the last `RECENT_WEEKS` of `weeks`, given oldest first.
pub fn recent_churn(weeks: &[WeeklyChurn]) -> u64 {
    weeks.iter().rev().take(RECENT_WEEKS).map(WeeklyChurn::changed_lines).sum()
}

/// Commits during the last `RECENT_WEEKS` of `weeks`, given oldest first.
pub fn recent_commits(weeks: &[u64]) -> u64 {
    weeks.iter().rev().take(RECENT_WEEKS).sum()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub totals: RepoStats,
    pub history: ActivityHistory,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepoStats {
    pub repositories: u64,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    pub releases: u64,
    pub churn: u64,
    pub commits: u64,
    /// Summed over repositories this would count people twice, so totals keep the largest count.
    pub contributors: u64,
}

impl From<&RepoSummary> for RepoStats {
    fn from(repo: &RepoSummary) -> Self {
        RepoStats {
            repositories: 1,
            stars: repo.stars,
            forks: repo.forks,
            watchers: repo.watchers,
            releases: 0,
            churn: 0,
            commits: 0,
            contributors: 0,
        }
    }
}

impl AddAssign for RepoStats {
    fn add_assign(&mut self, other: RepoStats) {
        self.repositories += other.repositories;
        self.stars += other.stars;
        self.forks += other.forks;
        self.watchers += other.watchers;
        self.releases += other.releases;
        self.churn += other.churn;
        self.commits += other.commits;
        self.contributors = self.contributors.max(other.contributors);
    }
}

impl Display for RepoStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "repositories: {}\tstars: {}\tforks: {}\twatchers: {}\treleases: {}\tchurn: {}\tcommits: {}\tcontributors: {}",
            self.repositories,
            self.stars,
            self.forks,
            self.watchers,
            self.releases,
            self.churn,
            self.commits,
            self.contributors
        ))
    }
}

/// Client and probed credentials shared by all requests of one invocation.
struct Session {
    client: GithubClient,
    pool: Arc<CredentialPool>,
    config: HarvestConfig,
}

impl Session {
    async fn connect(args: &Args) -> Result<Session> {
        let config = args.harvest_config();
        let client = GithubClientBuilder::default()
            .with_github_url(&args.api_url)
            .with_timeout(config.page_timeout)
            .build()?;
        let pool = CredentialPool::probe(&client, &config).await?;
        Ok(Session {
            client,
            pool: Arc::new(pool),
            config,
        })
    }

    /// Full listing of every owner, forks included.
    async fn owner_repositories(&self, owners: &[String]) -> Result<Vec<RepoSummary>> {
        let mut listing = Vec::new();
        for owner in owners {
            let kind = resolve_owner(&self.client, &self.pool, owner).await?;
            let scheduler = BatchScheduler::new(
                OwnerRepoPages::new(self.client.clone(), kind),
                self.pool.clone(),
                &self.config,
            );
            let repos = scheduler.fetch_all(owner, None).await?;
            info!("{} {} owns {} repositories", kind, owner, repos.len());
            listing.extend(repos);
        }
        Ok(listing)
    }
}
