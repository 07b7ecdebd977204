//! Durable progress of a harvesting run.
//!
//! Two files per run id live in the ledger directory:
//! `{run_id}_contributors.json` holds the merged buckets together with the ids merged into them,
//! `{run_id}_repos_seen.txt` is the append-only list of completed repositories.
//! The aggregate is always written before the completed list, so after a crash between the two
//! writes the files disagree and the run starts over.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::api::{Error, Result};
use crate::buckets::AggregateState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub completed: Vec<String>,
    pub state: AggregateState,
}

impl ProgressRecord {
    pub fn fresh(bucket_count: usize) -> Self {
        ProgressRecord {
            completed: Vec::new(),
            state: AggregateState::empty(bucket_count),
        }
    }

    pub fn is_complete(&self, repo: &str) -> bool {
        self.completed.iter().any(|completed| completed == repo)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredAggregate {
    merged: Vec<String>,
    buckets: AggregateState,
}

pub struct ProgressLedger {
    dir: PathBuf,
    bucket_count: usize,
}

impl ProgressLedger {
    /// `bucket_count` is the shape the current configuration expects from stored progress.
    pub fn new<P: Into<PathBuf>>(dir: P, bucket_count: usize) -> Self {
        ProgressLedger {
            dir: dir.into(),
            bucket_count,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn aggregate_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}_contributors.json", run_id))
    }

    pub fn progress_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}_repos_seen.txt", run_id))
    }

    /// Stored progress, or `None` when there is none or it cannot be trusted.
    /// Untrusted progress is deleted.
    pub fn load(&self, run_id: &str) -> Result<Option<ProgressRecord>> {
        let stored = match self.read_aggregate(run_id) {
            Ok(stored) => stored,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.progress_path(run_id).exists() {
                    warn!("{}: completed list without aggregate, discarding", run_id);
                    self.discard(run_id)?;
                }
                return Ok(None);
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!("{}: unreadable aggregate ({}), discarding", run_id, err);
                self.discard(run_id)?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if stored.buckets.len() != self.bucket_count {
            warn!(
                "{}: stored progress has {} buckets, configuration needs {}. Discarding",
                run_id,
                stored.buckets.len(),
                self.bucket_count
            );
            self.discard(run_id)?;
            return Ok(None);
        }
        let completed = self.read_completed(run_id)?;
        if completed != stored.merged {
            warn!(
                "{}: completed list ({} repos) disagrees with aggregate ({} repos), discarding",
                run_id,
                completed.len(),
                stored.merged.len()
            );
            self.discard(run_id)?;
            return Ok(None);
        }
        Ok(Some(ProgressRecord {
            completed,
            state: stored.buckets,
        }))
    }

    /// Loads stored progress or persists a fresh, empty one.
    pub fn begin(&self, run_id: &str) -> Result<ProgressRecord> {
        if let Some(record) = self.load(run_id)? {
            info!("{}: resuming after {} completed repos", run_id, record.completed.len());
            return Ok(record);
        }
        let record = ProgressRecord::fresh(self.bucket_count);
        fs::create_dir_all(&self.dir)?;
        self.write_aggregate(run_id, &record.completed, &record.state)?;
        let progress = File::create(self.progress_path(run_id))?;
        progress.sync_all()?;
        Ok(record)
    }

    /// Merges `state` into the stored aggregate and appends `repo` to the completed list,
    /// both flushed to disk before returning. Completing a repository twice is a no-op.
    /// Fails with [`Error::ProgressLost`] when the progress stored by [`ProgressLedger::begin`] is gone.
    pub fn mark_complete(&self, run_id: &str, repo: &str, state: &AggregateState) -> Result<ProgressRecord> {
        let mut record = self
            .load(run_id)?
            .ok_or_else(|| Error::ProgressLost(run_id.to_string()))?;
        if record.is_complete(repo) {
            debug!("{}: {} already complete", run_id, repo);
            return Ok(record);
        }
        record.state.merge(state)?;
        record.completed.push(repo.to_string());

        fs::create_dir_all(&self.dir)?;
        self.write_aggregate(run_id, &record.completed, &record.state)?;
        let mut progress = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.progress_path(run_id))?;
        writeln!(progress, "{}", repo)?;
        progress.sync_all()?;
        Ok(record)
    }

    pub fn merged_state(&self, run_id: &str) -> Result<AggregateState> {
        Ok(self.read_aggregate(run_id)?.buckets)
    }

    fn discard(&self, run_id: &str) -> Result<()> {
        for path in [self.aggregate_path(run_id), self.progress_path(run_id)] {
            match fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn read_aggregate(&self, run_id: &str) -> io::Result<StoredAggregate> {
        let file = File::open(self.aggregate_path(run_id))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn read_completed(&self, run_id: &str) -> Result<Vec<String>> {
        let file = match File::open(self.progress_path(run_id)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut completed = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let repo = line.trim();
            if !repo.is_empty() {
                completed.push(repo.to_string());
            }
        }
        Ok(completed)
    }

    fn write_aggregate(&self, run_id: &str, merged: &[String], buckets: &AggregateState) -> Result<()> {
        let stored = StoredAggregate {
            merged: merged.to_vec(),
            buckets: buckets.clone(),
        };
        write_atomically(&self.aggregate_path(run_id), &serde_json::to_vec(&stored)?)?;
        Ok(())
    }
}

/// Replaces `path` with `contents` through a synced temporary sibling.
fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}
