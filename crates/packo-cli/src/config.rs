//! Command line configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use packo_core::{CoreError, JobName};

/// Services built when no `--job` is given.
pub const DEFAULT_JOBS: [&str; 5] = ["controller", "build-init", "rebase", "webhook", "completion"];

/// packo - build every service image of a Go repository at once
#[derive(Parser, Debug)]
#[command(name = "packo")]
#[command(about = "Build a group of images concurrently and wait for all of them", long_about = None)]
pub struct Cli {
    /// Registry to tag images and source under
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Source directory to upload
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Namespace for build requests
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Job to build, repeatable (defaults to every service)
    #[arg(short, long = "job")]
    pub jobs: Vec<String>,

    /// Give up on the whole group after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// How long each simulated build takes
    #[arg(long)]
    pub build_duration_ms: Option<u64>,

    /// Print results as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Rejected configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("No registry provided. Please provide a registry with --registry")]
    EmptyRegistry,

    #[error("No source path provided. Please provide one with --path")]
    EmptyPath,

    #[error("No jobs to build")]
    NoJobs,

    #[error("Job '{0}' listed more than once")]
    DuplicateJob(String),

    #[error(transparent)]
    InvalidJob(#[from] CoreError),
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry images and source are tagged under.
    pub registry: String,

    /// Source directory to upload.
    pub source_path: PathBuf,

    /// Namespace for build requests.
    pub namespace: String,

    /// Cluster builder every job builds with.
    pub builder_name: String,

    /// Image of that builder.
    pub builder_image: String,

    /// Build cache size per job.
    pub cache_size: String,

    /// Jobs to build, in launch order.
    pub jobs: Vec<String>,

    /// Deadline for the whole group.
    pub timeout: Option<Duration>,

    /// Duration of each simulated build.
    pub build_duration: Duration,

    /// Emit JSON lines instead of human output.
    pub json: bool,

    /// Debug logging.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: "localhost:5000".to_string(),
            source_path: PathBuf::from("."),
            namespace: "default".to_string(),
            builder_name: "default-builder".to_string(),
            builder_image: "cloudfoundry/cnb:bionic".to_string(),
            cache_size: "2Gi".to_string(),
            jobs: DEFAULT_JOBS.iter().map(|j| j.to_string()).collect(),
            timeout: None,
            build_duration: Duration::from_secs(2),
            json: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Defaults overridden by whatever was given on the command line.
    pub fn from_cli(cli: Cli) -> Self {
        let mut config = Self::default();
        if let Some(registry) = cli.registry {
            config.registry = registry;
        }
        if let Some(path) = cli.path {
            config.source_path = path;
        }
        if let Some(namespace) = cli.namespace {
            config.namespace = namespace;
        }
        if !cli.jobs.is_empty() {
            config.jobs = cli.jobs;
        }
        config.timeout = cli.timeout_secs.map(Duration::from_secs);
        if let Some(ms) = cli.build_duration_ms {
            config.build_duration = Duration::from_millis(ms);
        }
        config.json = cli.json;
        config.verbose = cli.verbose;
        config
    }

    /// Validate and return the job names in launch order.
    pub fn job_names(&self) -> Result<Vec<JobName>, ConfigError> {
        if self.registry.trim().is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        if self.source_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }

        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if !seen.insert(job.as_str()) {
                return Err(ConfigError::DuplicateJob(job.clone()));
            }
            names.push(JobName::parse(job.as_str())?);
        }
        Ok(names)
    }
}
