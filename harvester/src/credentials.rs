use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::{Client, Credential, Error, Quota, Result};
use crate::config::HarvestConfig;

/// Cool-down applied to a credential rejected without a usable reset time.
pub const FALLBACK_COOLDOWN_SECS: i64 = 60;

/// First cool-down after a server fault. Doubles with every further fault in a row, up to `FALLBACK_COOLDOWN_SECS`.
pub const SERVER_FAULT_COOLDOWN_SECS: u64 = 2;

struct Slot {
    token: Arc<SecretString>,
    quota: Quota,
    /// Server faults since the last successful response.
    faults: u32,
    cooling_until: Option<Instant>,
}

impl Slot {
    fn is_usable(&self, at: Instant) -> bool {
        self.quota.remaining > 0 && self.cooling_until.map_or(true, |until| until <= at)
    }

    fn merge_quota(&mut self, quota: Quota) {
        if quota.reset > self.quota.reset {
            self.quota = quota;
        } else if quota.reset == self.quota.reset {
            // Min `remaining` because in case of parallel requests late response may arrive with old `remaining`
            self.quota.remaining = std::cmp::min(quota.remaining, self.quota.remaining);
            if quota.limit > 0 {
                self.quota.limit = quota.limit;
            }
        }
        // Older `reset` belongs to a previous window, nothing to learn from it
    }
}

struct PoolState {
    slots: Vec<Slot>,
    last_issued: Option<usize>,
}

/// Pool of access tokens with their last known quota.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    size: usize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<(SecretString, Quota)>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }
        let size = credentials.len();
        let slots = credentials
            .into_iter()
            .map(|(token, quota)| Slot {
                token: Arc::new(token),
                quota,
                faults: 0,
                cooling_until: None,
            })
            .collect();
        Ok(CredentialPool {
            state: Mutex::new(PoolState {
                slots,
                last_issued: None,
            }),
            size,
        })
    }

    /// Keeps the configured tokens that answer the rate limit probe.
    pub async fn probe<C>(client: &C, config: &HarvestConfig) -> Result<Self>
    where
        C: Client + ?Sized,
    {
        let mut credentials = Vec::with_capacity(config.tokens.len());
        for (index, token) in config.tokens.iter().enumerate() {
            match client.rate_limit(token).await {
                Ok(quota) => {
                    debug!("Credential #{} alive: {:?}", index, quota);
                    credentials.push((SecretString::new(token.expose_secret().clone()), quota));
                }
                Err(err) => warn!("Dropping credential #{}: {}", index, err),
            }
        }
        info!("{} of {} credentials usable", credentials.len(), config.tokens.len());
        Self::new(credentials)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns a credential with quota left, waiting for the soonest reset when there is none.
    pub async fn acquire(&self) -> Credential {
        loop {
            match self.try_acquire(Utc::now().timestamp()).await {
                Ok(credential) => return credential,
                Err(delay) => {
                    info!("All credentials rate limited. Waiting {} sec", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Prefers a credential other than the one issued last.
    /// Returns the time until the soonest reset or end of cool-down when nothing is usable.
    async fn try_acquire(&self, now: i64) -> std::result::Result<Credential, Duration> {
        let instant = Instant::now();
        let mut state = self.state.lock().await;
        for slot in state.slots.iter_mut() {
            if slot.quota.remaining == 0 && slot.quota.reset <= now {
                debug!("Old reset. Resetting remaining to limit.");
                // limit may be unknown (0), one probing request is still allowed
                slot.quota.remaining = slot.quota.limit.max(1);
            }
        }
        let usable: Vec<usize> = (0..state.slots.len())
            .filter(|index| state.slots[*index].is_usable(instant))
            .collect();
        let chosen = usable
            .iter()
            .copied()
            .find(|index| Some(*index) != state.last_issued)
            .or_else(|| usable.first().copied());
        if let Some(index) = chosen {
            state.last_issued = Some(index);
            let slot = &state.slots[index];
            return Ok(Credential::new(index, slot.token.clone(), slot.quota.remaining));
        }
        let soonest = state
            .slots
            .iter()
            .map(|slot| match slot.cooling_until {
                Some(until) if slot.quota.remaining > 0 => until.saturating_duration_since(instant),
                _ => Duration::from_secs((slot.quota.reset - now).max(0) as u64 + 1),
            })
            .min()
            .unwrap_or(Duration::from_secs(1));
        Err(soonest)
    }

    /// Folds the quota reported by a successful response into the credential's slot.
    pub async fn report_usage(&self, credential: &Credential, quota: Quota) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(credential.id()) {
            slot.faults = 0;
            slot.cooling_until = None;
            slot.merge_quota(quota);
            debug!("Updated credential #{} limits: {:?}", credential.id(), slot.quota);
        }
    }

    /// Takes a rejected credential out of rotation until `reset`, or for
    /// `FALLBACK_COOLDOWN_SECS` when no future reset is known.
    pub async fn mark_exhausted(&self, credential: &Credential, reset: Option<i64>) {
        let now = Utc::now().timestamp();
        let reset = reset.filter(|reset| *reset > now).unwrap_or(now + FALLBACK_COOLDOWN_SECS);
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(credential.id()) {
            slot.quota.remaining = 0;
            slot.quota.reset = std::cmp::max(slot.quota.reset, reset);
            warn!("Credential #{} exhausted until {}", credential.id(), slot.quota.reset);
        }
    }

    /// Benches a credential after a server fault, folding in the quota the fault reported.
    pub async fn cool_down(&self, credential: &Credential, quota: Option<Quota>) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.get_mut(credential.id()) {
            if let Some(quota) = quota {
                slot.merge_quota(quota);
            }
            slot.faults = slot.faults.saturating_add(1);
            let cooldown = SERVER_FAULT_COOLDOWN_SECS
                .saturating_mul(1u64 << (slot.faults - 1).min(16))
                .min(FALLBACK_COOLDOWN_SECS as u64);
            slot.cooling_until = Some(Instant::now() + Duration::from_secs(cooldown));
            warn!(
                "Credential #{} cooling down for {} sec after {} server faults",
                credential.id(),
                cooldown,
                slot.faults
            );
        }
    }

    /// Books a rejected request against `credential` and hands out the next credential.
    pub async fn rotate(&self, credential: &Credential, err: &Error) -> Credential {
        if let Error::RateLimited { status, quota } = err {
            match (status, quota) {
                (_, Some(quota)) if quota.remaining == 0 => {
                    self.mark_exhausted(credential, Some(quota.reset)).await;
                }
                (Some(403), quota) => {
                    self.mark_exhausted(credential, quota.map(|quota| quota.reset)).await;
                }
                (_, quota) => self.cool_down(credential, *quota).await,
            }
        }
        self.acquire().await
    }

    #[cfg(test)]
    async fn quota(&self, id: usize) -> Quota {
        self.state.lock().await.slots[id].quota
    }
}

/// Timeouts count as rate limiting until they persist across a full rotation of the pool.
pub(crate) struct TimeoutBudget {
    credentials: usize,
    consecutive: usize,
}

impl TimeoutBudget {
    pub(crate) fn new(credentials: usize) -> Self {
        TimeoutBudget {
            credentials,
            consecutive: 0,
        }
    }

    pub(crate) fn record(&mut self, err: &Error) -> Result<()> {
        if matches!(err, Error::Timeout) {
            self.consecutive += 1;
            if self.consecutive > self.credentials {
                return Err(Error::TimeoutsExhausted(self.credentials));
            }
        } else {
            self.consecutive = 0;
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Instant;

    fn token(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    fn pool(quotas: &[Quota]) -> CredentialPool {
        let credentials = quotas
            .iter()
            .enumerate()
            .map(|(index, quota)| (token(&format!("t{}", index)), *quota))
            .collect();
        CredentialPool::new(credentials).unwrap()
    }

    #[test]
    fn empty_pool_test() {
        assert!(matches!(CredentialPool::new(Vec::new()), Err(Error::NoCredentials)));
    }

    #[tokio::test]
    async fn rotates_between_usable_credentials_test() {
        let reset = Utc::now().timestamp() + 3600;
        let pool = pool(&[Quota::new(10, 5, reset), Quota::new(10, 5, reset)]);
        assert_eq!(pool.acquire().await.id(), 0);
        assert_eq!(pool.acquire().await.id(), 1);
        assert_eq!(pool.acquire().await.id(), 0);
    }

    #[tokio::test]
    async fn single_usable_credential_is_reissued_test() {
        let reset = Utc::now().timestamp() + 3600;
        let pool = pool(&[Quota::new(10, 0, reset), Quota::new(10, 5, reset)]);
        assert_eq!(pool.acquire().await.id(), 1);
        assert_eq!(pool.acquire().await.id(), 1);
        assert_eq!(pool.acquire().await.remaining(), 5);
    }

    #[tokio::test]
    async fn waits_for_soonest_reset_test() {
        let now = Utc::now().timestamp();
        let pool = pool(&[Quota::new(10, 0, now + 3600), Quota::new(10, 0, now + 1)]);

        let delay = pool.try_acquire(now).await.unwrap_err();
        assert_eq!(delay, Duration::from_secs(2), "soonest reset wins, not the latest");

        let started = Instant::now();
        let credential = pool.acquire().await;
        assert_eq!(credential.id(), 1);
        assert_eq!(credential.remaining(), 10);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn report_usage_keeps_freshest_snapshot_test() {
        let reset = Utc::now().timestamp() + 3600;
        let pool = pool(&[Quota::new(10, 8, reset)]);
        let credential = pool.acquire().await;

        pool.report_usage(&credential, Quota::new(10, 5, reset)).await;
        pool.report_usage(&credential, Quota::new(10, 7, reset)).await;
        assert_eq!(pool.quota(0).await.remaining, 5, "late response must not raise remaining");

        pool.report_usage(&credential, Quota::new(10, 9, reset - 10)).await;
        assert_eq!(pool.quota(0).await, Quota::new(10, 5, reset), "previous window ignored");

        pool.report_usage(&credential, Quota::new(10, 9, reset + 3600)).await;
        assert_eq!(pool.quota(0).await, Quota::new(10, 9, reset + 3600), "new window replaces");
    }

    #[tokio::test]
    async fn mark_exhausted_test() {
        let now = Utc::now().timestamp();
        let pool = pool(&[Quota::new(10, 8, now - 5), Quota::new(10, 8, now + 3600)]);
        let first = pool.acquire().await;
        pool.mark_exhausted(&first, None).await;
        let quota = pool.quota(0).await;
        assert_eq!(quota.remaining, 0);
        assert!(quota.reset >= now + FALLBACK_COOLDOWN_SECS);
        assert_eq!(pool.acquire().await.id(), 1);
        assert_eq!(pool.acquire().await.id(), 1);
    }

    struct Probe;

    #[async_trait]
    impl Client for Probe {
        async fn rate_limit(&self, token: &SecretString) -> Result<Quota> {
            match token.expose_secret().as_str() {
                "bad" => Err(Error::UnexpectedStatus {
                    status: 401,
                    resource: "rate_limit".to_string(),
                    page: 1,
                }),
                _ => Ok(Quota::new(5000, 4999, 0)),
            }
        }

        async fn owner_kind(&self, _: &Credential, _: &str) -> Result<crate::api::OwnerKind> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn probe_drops_dead_credentials_test() {
        let config = HarvestConfig {
            tokens: vec![token("bad"), token("good")],
            ..HarvestConfig::default()
        };
        let pool = CredentialPool::probe(&Probe, &config).await.unwrap();
        assert_eq!(pool.len(), 1);

        let config = HarvestConfig {
            tokens: vec![token("bad")],
            ..HarvestConfig::default()
        };
        assert!(matches!(
            CredentialPool::probe(&Probe, &config).await,
            Err(Error::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn rotate_test() {
        let now = Utc::now().timestamp();
        let pool = pool(&[Quota::new(10, 8, now + 3600), Quota::new(10, 8, now + 3600)]);
        let first = pool.acquire().await;

        let server_fault = Error::RateLimited {
            status: Some(502),
            quota: None,
        };
        assert_eq!(pool.rotate(&first, &server_fault).await.id(), 1);
        assert_eq!(pool.quota(0).await.remaining, 8, "server faults leave the quota alone");
        assert_eq!(pool.acquire().await.id(), 1, "cooling credential is skipped");

        let exhausted = Error::RateLimited {
            status: Some(403),
            quota: Some(Quota::new(10, 0, now + 7200)),
        };
        assert_eq!(pool.rotate(&first, &exhausted).await.id(), 1);
        assert_eq!(pool.quota(0).await, Quota::new(10, 0, now + 7200));
        assert_eq!(pool.acquire().await.id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_faults_back_off_test() {
        let reset = Utc::now().timestamp() + 3600;
        let pool = pool(&[Quota::new(10, 8, reset)]);
        let server_fault = Error::RateLimited {
            status: Some(502),
            quota: None,
        };
        let mut credential = pool.acquire().await;
        for faults in 0..4 {
            let started = tokio::time::Instant::now();
            credential = pool.rotate(&credential, &server_fault).await;
            assert_eq!(credential.id(), 0);
            let cooldown = Duration::from_secs(SERVER_FAULT_COOLDOWN_SECS << faults);
            let waited = started.elapsed();
            assert!(waited >= cooldown, "no reissue before the cool-down ends: {:?}", waited);
            assert!(waited < cooldown + Duration::from_secs(1));
        }

        pool.report_usage(&credential, Quota::new(10, 7, reset)).await;
        let started = tokio::time::Instant::now();
        pool.rotate(&credential, &server_fault).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(SERVER_FAULT_COOLDOWN_SECS));
        assert!(waited < Duration::from_secs(2 * SERVER_FAULT_COOLDOWN_SECS), "success clears the fault streak");
    }

    #[tokio::test(start_paused = true)]
    async fn server_faults_on_every_credential_wait_test() {
        let reset = Utc::now().timestamp() + 3600;
        let pool = pool(&[Quota::new(10, 8, reset), Quota::new(10, 8, reset)]);
        let server_fault = Error::RateLimited {
            status: Some(503),
            quota: Some(Quota::new(10, 6, reset)),
        };
        let started = tokio::time::Instant::now();
        let first = pool.acquire().await;
        let second = pool.rotate(&first, &server_fault).await;
        assert_eq!(second.id(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO, "other credential is free");
        assert_eq!(pool.quota(0).await.remaining, 6);

        assert_eq!(pool.rotate(&second, &server_fault).await.id(), 0);
        assert!(started.elapsed() >= Duration::from_secs(SERVER_FAULT_COOLDOWN_SECS));
    }

    #[test]
    fn timeout_budget_test() {
        let mut budget = TimeoutBudget::new(1);
        assert!(budget.record(&Error::Timeout).is_ok());
        budget.reset();
        assert!(budget.record(&Error::Timeout).is_ok());
        assert!(matches!(budget.record(&Error::Timeout), Err(Error::TimeoutsExhausted(1))));
    }
}
