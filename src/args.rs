use clap::{Parser, Subcommand};
use harvester::buckets::BucketWidth;
use harvester::config::{HarvestConfig, MAX_PER_PAGE};
use secrecy::{ExposeSecret, SecretString};
use std::{
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// TOML manifest listing GitHub organizations and repositories
    #[clap(short, long, env)]
    pub manifest: PathBuf,

    /// Space separated API access tokens
    #[clap(long, env = "GITHUB_PATS", hide_env_values = true)]
    pub github_pats: Option<SecretString>,

    /// API access token, repeatable
    #[clap(short, long = "token")]
    pub tokens: Vec<SecretString>,

    /// Repository API URL
    #[clap(long, env, default_value = "https://api.github.com")]
    pub api_url: String,

    /// Directory keeping the progress of runs
    #[clap(long, env, default_value = "output")]
    pub state_dir: PathBuf,

    /// Name of the run to start or resume, defaults to the manifest file name
    #[clap(long, env)]
    pub run_id: Option<String>,

    /// Years of history to cover
    #[clap(short, long, env, default_value_t = 1, parse(try_from_str=years_in_range))]
    pub years: u32,

    /// Bucket width: monthly or weekly
    #[clap(short, long, env, default_value = "monthly")]
    pub bucket: BucketWidth,

    /// Items per requested page
    #[clap(long, env, default_value_t = MAX_PER_PAGE, parse(try_from_str=per_page_in_range))]
    pub per_page: u32,

    /// Single page request timeout
    #[clap(long, env, default_value_t = 30, parse(try_from_str=timeout_secs_in_range))]
    pub timeout_secs: u64,

    /// Print contributor names, not only their numbers
    #[clap(short, long)]
    pub detail: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Distinct contributors per time bucket
    Contributors,
    /// Stars, forks, watchers, releases, contributors, recent churn and commits, plus weekly history
    Stats,
}

impl Args {
    /// Tokens of `--token` followed by those of `GITHUB_PATS`.
    pub fn tokens(&self) -> Vec<SecretString> {
        let mut tokens: Vec<SecretString> = self
            .tokens
            .iter()
            .map(|token| SecretString::new(token.expose_secret().clone()))
            .collect();
        if let Some(pats) = &self.github_pats {
            tokens.extend(
                pats.expose_secret()
                    .split_whitespace()
                    .map(|token| SecretString::new(token.to_string())),
            );
        }
        tokens
    }

    pub fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig {
            tokens: self.tokens(),
            per_page: self.per_page,
            page_timeout: Duration::from_secs(self.timeout_secs),
            bucket_width: self.bucket,
            years: self.years,
            ..HarvestConfig::default()
        }
    }

    pub fn run_id(&self) -> String {
        self.run_id.clone().unwrap_or_else(|| {
            self.manifest
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "run".to_string())
        })
    }
}

fn years_in_range(value: &str) -> clap::Result<u32, String> {
    number_in_range(value, 1, 4, "years".to_string())
}

fn per_page_in_range(value: &str) -> clap::Result<u32, String> {
    number_in_range(value, 1, MAX_PER_PAGE, "per_page".to_string())
}

fn timeout_secs_in_range(value: &str) -> clap::Result<u64, String> {
    number_in_range(value, 1, u64::MAX, "timeout_secs".to_string())
}

fn number_in_range<T>(value: &str, min: T, max: T, name: String) -> clap::Result<T, String>
where
    T: FromStr + PartialOrd + Display,
    <T as FromStr>::Err: Display,
{
    value.parse::<T>().map_err(|err| format!("{}", err)).and_then(|value| {
        if value < min || value > max {
            return Err(format!("{} is not in range {} .. {}.", name, min, max));
        }
        Ok(value)
    })
}
