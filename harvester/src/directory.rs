use log::{debug, warn};

use crate::api::{Client, OwnerKind, RepoSummary, Result};
use crate::credentials::{CredentialPool, TimeoutBudget};

/// Probes whether `owner` is an organization or a user, rotating credentials while rate limited.
pub async fn resolve_owner<C>(client: &C, pool: &CredentialPool, owner: &str) -> Result<OwnerKind>
where
    C: Client + ?Sized,
{
    let mut timeouts = TimeoutBudget::new(pool.len());
    let mut credential = pool.acquire().await;
    loop {
        match client.owner_kind(&credential, owner).await {
            Ok(kind) => {
                debug!("{} is an {}", owner, kind);
                return Ok(kind);
            }
            Err(err) if err.is_transient() => {
                timeouts.record(&err)?;
                warn!("Resolving {} failed with {}, rotating credential", owner, err);
                credential = pool.rotate(&credential, &err).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Lowercased `owner/name` of every repository that is not a fork, in listing order.
pub fn own_repositories(listing: &[RepoSummary]) -> Vec<String> {
    listing
        .iter()
        .filter(|repo| !repo.fork)
        .map(|repo| repo.full_name.to_lowercase())
        .collect()
}
