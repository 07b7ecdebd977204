use std::fs;
use std::path::Path;

use anyhow::Context;
use harvester::api::Result;
use log::warn;
use serde::Deserialize;

const GITHUB_PREFIX: &str = "https://github.com/";

/// Ecosystem manifest: organizations whose repositories are all harvested, plus single repositories.
#[derive(Deserialize, Debug, Default)]
pub struct Manifest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    github_organizations: Vec<String>,
    #[serde(default, rename = "repo")]
    repos: Vec<RepoEntry>,
}

#[derive(Deserialize, Debug)]
struct RepoEntry {
    url: String,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let content = fs::read_to_string(path).with_context(|| format!("Reading manifest {}", path.display()))?;
        Ok(Manifest::parse(&content).with_context(|| format!("Parsing manifest {}", path.display()))?)
    }

    fn parse(content: &str) -> anyhow::Result<Manifest> {
        Ok(toml::from_str(content)?)
    }

    /// Lowercased names of the listed GitHub organizations (or users), in manifest order.
    pub fn owners(&self) -> Vec<String> {
        let mut owners = Vec::new();
        for entry in &self.github_organizations {
            match github_path(entry) {
                Some(owner) if !owner.contains('/') => push_unique(&mut owners, owner),
                _ => warn!("Ignoring organization entry {}", entry),
            }
        }
        owners
    }

    /// Lowercased `owner/name` of the explicitly listed repositories, in manifest order.
    pub fn repositories(&self) -> Vec<String> {
        let mut repos = Vec::new();
        for entry in &self.repos {
            match github_path(&entry.url) {
                Some(repo) if repo.split('/').count() == 2 => push_unique(&mut repos, repo),
                _ => warn!("Ignoring repository entry {}", entry.url),
            }
        }
        repos
    }
}

/// Appends `value` unless it is already present, keeping first appearance order.
pub(crate) fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

fn github_path(url: &str) -> Option<String> {
    let lowercase = url.trim().to_lowercase();
    let path = lowercase.strip_prefix(GITHUB_PREFIX)?.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    (!path.is_empty()).then(|| path.to_string())
}
