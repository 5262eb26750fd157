//! packo - build a group of service images concurrently.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use packo_build::memory::{MemoryLogSource, MemoryStore, SimulatedController};
use packo_build::{
    ensure_builder, run_group, ArtifactUploader, BuildTask, DigestUploader, GroupTask, StdoutSink,
    TaskSettings,
};
use packo_core::{BuildRequest, BuilderRef, ClusterBuilderSpec, UpdatePolicy};

mod config;
mod report;

use config::{Cli, Config};
use report::Reporter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_cli(Cli::parse());

    // Logs go to stderr; stdout carries build output and results.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install logger: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::from(exit_status(run(config).await))
}

/// Process exit status for the outcome of [`run`].
fn exit_status(result: Result<bool, Box<dyn std::error::Error>>) -> u8 {
    match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "packo failed");
            1
        }
    }
}

/// Set up, build every job, and report. Returns whether the group succeeded.
async fn run(config: Config) -> Result<bool, Box<dyn std::error::Error>> {
    let jobs = config.job_names()?;

    info!(
        registry = %config.registry,
        namespace = %config.namespace,
        jobs = jobs.len(),
        "Starting packo"
    );

    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(MemoryLogSource::new());
    let backend = CancellationToken::new();
    let controller = SimulatedController::new(store.clone(), logs.clone())
        .with_build_duration(config.build_duration)
        .spawn(backend.clone());

    ensure_builder(
        store.as_ref(),
        &config.builder_name,
        ClusterBuilderSpec {
            image: config.builder_image.clone(),
            update_policy: UpdatePolicy::Polling,
        },
    )
    .await?;

    if !config.json {
        println!("Uploading {} ...", config.source_path.display());
    }
    let source = DigestUploader::new()
        .upload(&config.source_path, &config.registry)
        .await?;

    // JSON mode keeps stdout for result lines only.
    let settings = TaskSettings {
        stream_logs: !config.json,
        ..TaskSettings::default()
    };
    let sink = Arc::new(StdoutSink::new());
    let tasks: Vec<Arc<dyn GroupTask>> = jobs
        .into_iter()
        .map(|job| {
            let request = BuildRequest::for_go_command(
                job,
                config.namespace.as_str(),
                &config.registry,
                source.clone(),
                BuilderRef::cluster_builder(config.builder_name.as_str()),
            )
            .with_cache_size(config.cache_size.as_str());
            Arc::new(
                BuildTask::new(request, store.clone(), logs.clone(), sink.clone())
                    .with_settings(settings.clone()),
            ) as Arc<dyn GroupTask>
        })
        .collect();

    let base = CancellationToken::new();
    let cancel_sources = spawn_cancel_sources(base.clone(), config.timeout);

    let started_at = Utc::now();
    let report = run_group(&base, tasks).await;
    let finished_at = Utc::now();

    cancel_sources.abort();
    backend.cancel();
    if let Err(e) = controller.await {
        warn!(error = %e, "Build controller failed");
    }

    let mut stdout = std::io::stdout().lock();
    Reporter::new(config.json).write(&mut stdout, &report, started_at, finished_at)?;

    Ok(report.outcome.is_success())
}

/// Cancel `base` on Ctrl-C or once `timeout` elapses.
fn spawn_cancel_sources(base: CancellationToken, timeout: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = interrupted => warn!("Interrupted, cancelling builds"),
            _ = deadline => warn!(
                timeout_secs = timeout.map(|t| t.as_secs()).unwrap_or_default(),
                "Timed out, cancelling builds"
            ),
        }
        base.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(source: &std::path::Path) -> Config {
        Config {
            registry: "registry.local".to_string(),
            source_path: source.to_path_buf(),
            build_duration: Duration::from_millis(10),
            json: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(Ok(true)), 0);
        assert_eq!(exit_status(Ok(false)), 1);
        assert_eq!(exit_status(Err("no registry".into())), 1);
    }

    #[tokio::test]
    async fn test_run_builds_default_jobs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example.com/kpack").unwrap();

        let succeeded = run(local_config(dir.path())).await.unwrap();
        assert!(succeeded);
    }

    #[tokio::test]
    async fn test_run_reports_timeout_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            build_duration: Duration::from_secs(60),
            timeout: Some(Duration::from_millis(50)),
            ..local_config(dir.path())
        };

        let succeeded = run(config).await.unwrap();
        assert!(!succeeded);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            jobs: Vec::new(),
            ..local_config(dir.path())
        };

        assert!(run(config).await.is_err());
    }
}
