use chrono::Utc;
use log::info;

use crate::api::{ActivityRecord, PageFetcher, Result};
use crate::buckets::{AggregateState, BucketPlan, BucketWidth};
use crate::config::HarvestConfig;
use crate::ledger::{ProgressLedger, ProgressRecord};
use crate::scheduler::BatchScheduler;

#[derive(Debug)]
pub struct HarvestReport {
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub record: ProgressRecord,
}

/// Harvests repositories one at a time, committing each through the ledger.
pub struct HarvestOrchestrator<F>
where
    F: PageFetcher<Item = ActivityRecord>,
{
    scheduler: BatchScheduler<F>,
    ledger: ProgressLedger,
    bucket_width: BucketWidth,
}

impl<F> HarvestOrchestrator<F>
where
    F: PageFetcher<Item = ActivityRecord>,
{
    pub fn new(scheduler: BatchScheduler<F>, ledger: ProgressLedger, config: &HarvestConfig) -> Self {
        HarvestOrchestrator {
            scheduler,
            ledger,
            bucket_width: config.bucket_width,
        }
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    /// Repositories already completed under `run_id` are skipped.
    /// A fatal error stops the run, leaving the ledger as of the last completed repository.
    pub async fn run(&self, run_id: &str, repos: &[String]) -> Result<HarvestReport> {
        let mut record = self.ledger.begin(run_id)?;
        let mut processed = Vec::new();
        let mut skipped = Vec::new();
        // Don't run repositories concurrently, they share the quota
        for repo in repos {
            if record.is_complete(repo) {
                info!("Ignoring seen repo: {}", repo);
                skipped.push(repo.clone());
                continue;
            }
            info!("Analysing repo: {}", repo);
            let state = self.harvest_repo(repo).await?;
            record = self.ledger.mark_complete(run_id, repo, &state)?;
            processed.push(repo.clone());
        }
        Ok(HarvestReport {
            processed,
            skipped,
            record,
        })
    }

    pub async fn harvest_repo(&self, repo: &str) -> Result<AggregateState> {
        let plan = BucketPlan::ending_at(Utc::now(), self.ledger.bucket_count(), self.bucket_width);
        let records = self.scheduler.fetch_all(repo, plan.window()).await?;
        Ok(plan.aggregate(records))
    }
}
