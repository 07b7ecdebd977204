//! Time bucketing of activity records.
//!
//! A [`BucketPlan`] fixes `count` half-open intervals ending at a given instant before any
//! record is looked at. Records are then folded into an [`AggregateState`], one identity set
//! and one commit counter per interval.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::api::{ActivityRecord, Error, Result, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BucketWidth {
    Weekly,
    Monthly,
}

impl BucketWidth {
    pub fn days(self) -> i64 {
        match self {
            BucketWidth::Weekly => 7,
            // 12 'months' make 360 days
            BucketWidth::Monthly => 30,
        }
    }

    pub fn per_year(self) -> usize {
        match self {
            BucketWidth::Weekly => 52,
            BucketWidth::Monthly => 12,
        }
    }
}

/// `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPlan {
    intervals: Vec<Interval>,
}

impl BucketPlan {
    /// `count` contiguous intervals of `width` covering `[end - count * width, end)`,
    /// in chronological order.
    pub fn ending_at(end: DateTime<Utc>, count: usize, width: BucketWidth) -> Self {
        let boundaries: Vec<DateTime<Utc>> = (0..=count)
            .rev()
            .map(|steps| end - Duration::days(width.days() * steps as i64))
            .collect();
        let intervals = boundaries
            .windows(2)
            .map(|pair| Interval {
                start: pair[0],
                end: pair[1],
            })
            .collect();
        BucketPlan { intervals }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Fetch filter spanning the whole plan.
    pub fn window(&self) -> Option<TimeWindow> {
        let first = self.intervals.first()?;
        let last = self.intervals.last()?;
        Some(TimeWindow::new(first.start, Some(last.end)))
    }

    pub fn locate(&self, timestamp: DateTime<Utc>) -> Option<usize> {
        self.intervals.iter().position(|interval| interval.contains(timestamp))
    }

    /// Records outside every interval, or without an identity, add nothing to the identity sets.
    /// Unattributed records inside the plan still count as commits.
    pub fn aggregate<I>(&self, records: I) -> AggregateState
    where
        I: IntoIterator<Item = ActivityRecord>,
    {
        let mut state = AggregateState::empty(self.len());
        for record in records {
            if let Some(index) = self.locate(record.timestamp) {
                state.add(index, record.identity);
            }
        }
        state
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketContents {
    pub identities: BTreeSet<String>,
    pub commits: u64,
}

/// Per-bucket contents in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateState {
    buckets: Vec<BucketContents>,
}

impl AggregateState {
    pub fn empty(bucket_count: usize) -> Self {
        // each bucket owns its own set
        let buckets = (0..bucket_count).map(|_| BucketContents::default()).collect();
        AggregateState { buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn buckets(&self) -> &[BucketContents] {
        &self.buckets
    }

    /// No-op for an out of range `index`.
    pub fn add(&mut self, index: usize, identity: Option<String>) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.commits += 1;
            if let Some(identity) = identity {
                bucket.identities.insert(identity);
            }
        }
    }

    /// Positional merge: identities are unioned and commit counts summed bucket by bucket.
    pub fn merge(&mut self, other: &AggregateState) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::BucketMismatch {
                expected: self.len(),
                found: other.len(),
            });
        }
        for (bucket, incoming) in self.buckets.iter_mut().zip(&other.buckets) {
            bucket.identities.extend(incoming.identities.iter().cloned());
            bucket.commits += incoming.commits;
        }
        Ok(())
    }

    /// Distinct identities per bucket.
    pub fn counts(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.identities.len()).collect()
    }

    pub fn identities(&self) -> Vec<Vec<String>> {
        self.buckets
            .iter()
            .map(|bucket| bucket.identities.iter().cloned().collect())
            .collect()
    }

    pub fn commits(&self) -> Vec<u64> {
        self.buckets.iter().map(|bucket| bucket.commits).collect()
    }

    /// Identities active in any bucket, each counted once over the whole window.
    pub fn distinct_identities(&self) -> BTreeSet<&str> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.identities.iter().map(String::as_str))
            .collect()
    }

    pub fn total_commits(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.commits).sum()
    }
}
