use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use log::{debug, info, warn};

use crate::api::{Credential, Error, PageFetcher, PageRequest, PageResult, Result, TimeWindow, FIRST_PAGE_NUMBER};
use crate::config::HarvestConfig;
use crate::credentials::{CredentialPool, TimeoutBudget};

/// Drives a [`PageFetcher`] over every page of a resource in quota-bounded concurrent batches.
pub struct BatchScheduler<F>
where
    F: PageFetcher,
{
    fetcher: F,
    pool: Arc<CredentialPool>,
    per_page: u32,
    page_timeout: Duration,
    max_batch_pages: u32,
}

impl<F> BatchScheduler<F>
where
    F: PageFetcher,
{
    pub fn new(fetcher: F, pool: Arc<CredentialPool>, config: &HarvestConfig) -> Self {
        BatchScheduler {
            fetcher,
            pool,
            per_page: config.per_page,
            page_timeout: config.page_timeout,
            max_batch_pages: config.max_batch_pages.max(1),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// All items of `resource`, in page order.
    /// An empty or missing first page yields an empty list.
    pub async fn fetch_all(&self, resource: &str, window: Option<TimeWindow>) -> Result<Vec<F::Item>> {
        let mut timeouts = TimeoutBudget::new(self.pool.len());
        let mut credential = self.pool.acquire().await;

        let first = loop {
            match self.fetch_page(&credential, resource, FIRST_PAGE_NUMBER, window).await {
                Ok(page) => break page,
                Err(err) if err.is_transient() => {
                    timeouts.record(&err)?;
                    warn!("{}: first page failed with {}, rotating credential", resource, err);
                    credential = self.pool.rotate(&credential, &err).await;
                }
                Err(err) => return Err(err),
            }
        };
        timeouts.reset();

        if first.items.is_empty() {
            debug!("{}: nothing to harvest", resource);
            return Ok(Vec::new());
        }
        let total_pages = first.total_pages.unwrap_or(FIRST_PAGE_NUMBER).max(FIRST_PAGE_NUMBER);
        let mut quota = credential.remaining();
        if let Some(reported) = first.quota {
            quota = reported.remaining;
            self.pool.report_usage(&credential, reported).await;
        }

        let mut pages = BTreeMap::new();
        pages.insert(FIRST_PAGE_NUMBER, first.items);
        let mut missing: VecDeque<u32> = (FIRST_PAGE_NUMBER + 1..=total_pages).collect();

        while !missing.is_empty() {
            if quota == 0 {
                credential = self.pool.acquire().await;
                quota = credential.remaining();
            }
            let batch_size = [quota, self.max_batch_pages, missing.len() as u32]
                .into_iter()
                .min()
                .unwrap_or(1)
                .max(1) as usize;
            let batch: Vec<u32> = missing.drain(..batch_size).collect();
            debug!(
                "{}: fetching pages {:?}..={:?} with credential #{}",
                resource,
                batch.first(),
                batch.last(),
                credential.id()
            );

            let outcomes: Vec<(u32, Result<PageResult<F::Item>>)> = stream::iter(batch)
                .map(|page| {
                    let credential = &credential;
                    async move { (page, self.fetch_page(credential, resource, page, window).await) }
                })
                .buffered(batch_size)
                .collect()
                .await;

            let mut retry = Vec::new();
            let mut transient: Option<Error> = None;
            let mut fetched = 0u32;
            let mut lowest_reported: Option<u32> = None;
            for (page, outcome) in outcomes {
                match outcome {
                    Ok(result) => {
                        if let Some(reported) = result.quota {
                            lowest_reported = Some(lowest_reported.map_or(reported.remaining, |r| r.min(reported.remaining)));
                            self.pool.report_usage(&credential, reported).await;
                        }
                        pages.insert(page, result.items);
                        fetched += 1;
                    }
                    Err(err) if err.is_transient() => {
                        retry.push(page);
                        // a rate limit in the batch outranks a timeout
                        if !matches!(transient, Some(Error::RateLimited { .. })) {
                            transient = Some(err);
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            debug!("{}: {} successful requests", resource, fetched);

            quota = quota.saturating_sub(fetched);
            if let Some(reported) = lowest_reported {
                quota = quota.min(reported);
            }

            match transient {
                None => timeouts.reset(),
                Some(err) => {
                    timeouts.record(&err)?;
                    warn!(
                        "{}: {} of the batch pages failed with {}, rotating credential",
                        resource,
                        retry.len(),
                        err
                    );
                    for page in retry.into_iter().rev() {
                        missing.push_front(page);
                    }
                    credential = self.pool.rotate(&credential, &err).await;
                    quota = credential.remaining();
                }
            }
        }

        info!("{}: fetched {} pages", resource, pages.len());
        Ok(pages.into_values().flatten().collect())
    }

    async fn fetch_page(
        &self,
        credential: &Credential,
        resource: &str,
        page: u32,
        window: Option<TimeWindow>,
    ) -> Result<PageResult<F::Item>> {
        let request = PageRequest::new(resource.to_string(), page, self.per_page, window);
        match tokio::time::timeout(self.page_timeout, self.fetcher.fetch(credential, &request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Quota;
    use crate::credentials::SERVER_FAULT_COOLDOWN_SECS;
    use async_trait::async_trait;
    use chrono::Utc;
    use secrecy::SecretString;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// `total` pages of `per_page` numbered items; listed pages fail once with the given error.
    struct FakePages {
        total: u32,
        per_page: u32,
        failing_once: Mutex<HashSet<u32>>,
        failure: fn() -> Error,
        hanging: HashSet<u32>,
        calls: Mutex<HashMap<u32, u32>>,
        credentials_used: Mutex<Vec<usize>>,
    }

    impl FakePages {
        fn new(total: u32) -> Self {
            FakePages {
                total,
                per_page: 3,
                failing_once: Mutex::new(HashSet::new()),
                failure: || Error::RateLimited {
                    status: Some(502),
                    quota: None,
                },
                hanging: HashSet::new(),
                calls: Mutex::new(HashMap::new()),
                credentials_used: Mutex::new(Vec::new()),
            }
        }

        fn failing_once(self, pages: &[u32], failure: fn() -> Error) -> Self {
            *self.failing_once.lock().unwrap() = pages.iter().copied().collect();
            FakePages { failure, ..self }
        }

        fn calls(&self, page: u32) -> u32 {
            self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl PageFetcher for Arc<FakePages> {
        type Item = u32;

        async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<u32>> {
            *self.calls.lock().unwrap().entry(request.page).or_default() += 1;
            self.credentials_used.lock().unwrap().push(credential.id());
            if self.hanging.contains(&request.page) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing_once.lock().unwrap().remove(&request.page) {
                return Err((self.failure)());
            }
            if self.total == 0 {
                return Ok(PageResult::not_found(None));
            }
            let first = (request.page - 1) * self.per_page;
            let items = (first..first + self.per_page).collect();
            let quota = Quota::new(5000, 4000, Utc::now().timestamp() + 3600);
            let total_pages = (request.page == FIRST_PAGE_NUMBER).then(|| self.total);
            Ok(PageResult::new(items, total_pages, Some(quota)))
        }
    }

    /// One item per page, served against a budget of `budget` requests per credential.
    struct MeteredPages {
        total: u32,
        budget: u32,
        reset: i64,
        spent: Mutex<HashMap<usize, u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        served_by: Mutex<BTreeMap<u32, usize>>,
    }

    impl MeteredPages {
        fn new(total: u32, budget: u32, reset: i64) -> Self {
            MeteredPages {
                total,
                budget,
                reset,
                spent: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                served_by: Mutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for Arc<MeteredPages> {
        type Item = u32;

        async fn fetch(&self, credential: &Credential, request: &PageRequest) -> Result<PageResult<u32>> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let remaining = {
                let mut spent = self.spent.lock().unwrap();
                let spent = spent.entry(credential.id()).or_default();
                *spent += 1;
                self.budget.checked_sub(*spent)
            };
            let remaining = match remaining {
                Some(remaining) => remaining,
                None => {
                    return Err(Error::RateLimited {
                        status: Some(403),
                        quota: Some(Quota::new(self.budget, 0, self.reset)),
                    })
                }
            };
            self.served_by.lock().unwrap().insert(request.page, credential.id());
            let total_pages = (request.page == FIRST_PAGE_NUMBER).then(|| self.total);
            let quota = Quota::new(self.budget, remaining, self.reset);
            Ok(PageResult::new(vec![request.page], total_pages, Some(quota)))
        }
    }

    fn pool(credentials: usize) -> Arc<CredentialPool> {
        let reset = Utc::now().timestamp() + 3600;
        let credentials = (0..credentials)
            .map(|index| (SecretString::new(format!("t{}", index)), Quota::new(5000, 4000, reset)))
            .collect();
        Arc::new(CredentialPool::new(credentials).unwrap())
    }

    fn scheduler(fetcher: &Arc<FakePages>, credentials: usize, max_batch_pages: u32) -> BatchScheduler<Arc<FakePages>> {
        let config = HarvestConfig {
            max_batch_pages,
            page_timeout: Duration::from_secs(5),
            ..HarvestConfig::default()
        };
        BatchScheduler::new(fetcher.clone(), pool(credentials), &config)
    }

    #[tokio::test]
    async fn pagination_completeness_test() {
        let fetcher = Arc::new(FakePages::new(7));
        let items = scheduler(&fetcher, 1, 3).fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items, (0..21).collect::<Vec<u32>>());
        assert_eq!(fetcher.total_calls(), 7);
    }

    #[tokio::test]
    async fn empty_resource_test() {
        let fetcher = Arc::new(FakePages::new(0));
        let items = scheduler(&fetcher, 1, 200).fetch_all("org/gone", None).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(fetcher.total_calls(), 1);
    }

    #[tokio::test]
    async fn partial_batch_retention_test() {
        // page 1 alone, then one batch of 10 where 3 are rate limited
        let fetcher = Arc::new(FakePages::new(11).failing_once(&[3, 6, 9], || Error::RateLimited {
            status: Some(502),
            quota: None,
        }));
        let items = scheduler(&fetcher, 2, 200).fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items, (0..33).collect::<Vec<u32>>());
        for page in [3, 6, 9] {
            assert_eq!(fetcher.calls(page), 2, "page {} is fetched again after rotation", page);
        }
        for page in [1, 2, 4, 5, 7, 8, 10, 11] {
            assert_eq!(fetcher.calls(page), 1, "page {} is kept from the first batch", page);
        }
        let used = fetcher.credentials_used.lock().unwrap().clone();
        assert_eq!(used.last(), Some(&1), "retries go out with the rotated credential");
    }

    #[tokio::test]
    async fn rate_limited_first_page_is_retried_test() {
        let fetcher = Arc::new(FakePages::new(2).failing_once(&[1], || Error::RateLimited {
            status: Some(403),
            quota: Some(Quota::new(5000, 0, Utc::now().timestamp() + 3600)),
        }));
        let items = scheduler(&fetcher, 2, 200).fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items.len(), 6);
        assert_eq!(fetcher.calls(1), 2);
        assert_eq!(*fetcher.credentials_used.lock().unwrap(), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn fatal_error_aborts_test() {
        let fetcher = Arc::new(FakePages::new(4).failing_once(&[3], || Error::MalformedResponse {
            resource: "org/repo".to_string(),
            page: 3,
        }));
        let result = scheduler(&fetcher, 1, 200).fetch_all("org/repo", None).await;
        assert!(matches!(result, Err(Error::MalformedResponse { page: 3, .. })));
        assert_eq!(fetcher.calls(4), 1, "in-flight batch members are awaited");
    }

    #[tokio::test]
    async fn single_timeout_is_retried_test() {
        let fetcher = Arc::new(FakePages::new(3).failing_once(&[2], || Error::Timeout));
        let items = scheduler(&fetcher, 1, 200).fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items.len(), 9);
        assert_eq!(fetcher.calls(2), 2);
    }

    #[tokio::test]
    async fn batches_never_exceed_quota_test() {
        let reset = Utc::now().timestamp() + 3600;
        let fetcher = Arc::new(MeteredPages::new(10, 3, reset));
        let credentials = (0..4)
            .map(|index| (SecretString::new(format!("t{}", index)), Quota::new(3, 3, reset)))
            .collect();
        let pool = Arc::new(CredentialPool::new(credentials).unwrap());
        let scheduler = BatchScheduler::new(fetcher.clone(), pool, &HarvestConfig::default());

        let items = scheduler.fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items, (1..=10).collect::<Vec<u32>>());
        let max_in_flight = fetcher.max_in_flight.load(Ordering::SeqCst);
        assert!(max_in_flight <= 3, "{} requests in flight on a quota of 3", max_in_flight);
        let served_by: Vec<usize> = fetcher.served_by.lock().unwrap().values().copied().collect();
        assert_eq!(
            served_by,
            vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3],
            "spent credentials are replaced before the next batch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_fault_on_single_credential_waits_test() {
        let fetcher = Arc::new(FakePages::new(3).failing_once(&[2], || Error::RateLimited {
            status: Some(502),
            quota: None,
        }));
        let started = tokio::time::Instant::now();
        let items = scheduler(&fetcher, 1, 200).fetch_all("org/repo", None).await.unwrap();
        assert_eq!(items.len(), 9);
        assert_eq!(fetcher.calls(2), 2);
        assert_eq!(fetcher.total_calls(), 4);
        assert!(
            started.elapsed() >= Duration::from_secs(SERVER_FAULT_COOLDOWN_SECS),
            "retry waits for the cool-down instead of reusing the credential at once"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_are_fatal_test() {
        let mut fetcher = FakePages::new(3);
        fetcher.hanging.insert(2);
        let fetcher = Arc::new(fetcher);
        let result = scheduler(&fetcher, 2, 200).fetch_all("org/repo", None).await;
        assert!(matches!(result, Err(Error::TimeoutsExhausted(2))));
        assert_eq!(fetcher.calls(2), 3, "one try per credential plus the escalating one");
        assert_eq!(fetcher.calls(3), 1);
    }
}
