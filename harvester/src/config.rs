use std::time::Duration;

use secrecy::SecretString;

use crate::buckets::BucketWidth;

pub const MAX_PER_PAGE: u32 = 100;
/// Upper bound on concurrently issued page fetches, whatever the credential quota.
pub const MAX_BATCH_PAGES: u32 = 200;

/// Everything the engine needs, built once by the caller.
#[derive(Debug)]
pub struct HarvestConfig {
    pub tokens: Vec<SecretString>,
    pub per_page: u32,
    pub page_timeout: Duration,
    pub max_batch_pages: u32,
    pub bucket_width: BucketWidth,
    pub years: u32,
}

impl HarvestConfig {
    pub fn bucket_count(&self) -> usize {
        self.years as usize * self.bucket_width.per_year()
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            tokens: Vec::new(),
            per_page: MAX_PER_PAGE,
            page_timeout: Duration::from_secs(30),
            max_batch_pages: MAX_BATCH_PAGES,
            bucket_width: BucketWidth::Monthly,
            years: 1,
        }
    }
}

#[test]
fn bucket_count_test() {
    let mut config = HarvestConfig::default();
    assert_eq!(config.bucket_count(), 12);
    config.years = 2;
    config.bucket_width = BucketWidth::Weekly;
    assert_eq!(config.bucket_count(), 104);
}
