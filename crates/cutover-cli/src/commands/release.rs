use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use cutover_core::{Digest, PipelineRun, RunOutcome, StageOutcome, Trigger};
use cutover_pipeline::{CommandTestExecutor, ReleaseOrchestrator};
use cutover_registry::{StoreRegistry, content_digest, image_tag_for_commit};
use cutover_rollout::LocalPlatform;
use cutover_taskdef::{EnvOverrides, EnvSecretStore};

use super::Paths;

pub struct RunOptions {
    pub environment: String,
    pub commit: String,
    pub branch: String,
    pub overrides: Vec<String>,
    pub test_cmd: Option<String>,
    pub definitions_dir: Option<PathBuf>,
    pub circuit_breaker: Option<u32>,
}

/// Parse repeated `KEY=VALUE` arguments.
fn parse_overrides(raw: &[String]) -> anyhow::Result<EnvOverrides> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .with_context(|| format!("override '{pair}' is not KEY=VALUE"))
        })
        .collect()
}

pub async fn run(paths: &Paths, options: RunOptions) -> anyhow::Result<()> {
    let config = paths.load_config()?;
    let resolver = cutover_core::EnvironmentResolver::from_config(&config)?;
    let store = paths.open_store()?;
    let overrides = parse_overrides(&options.overrides)?;

    let mut platform = LocalPlatform::new(store.clone());
    if let Some(restarts) = options.circuit_breaker {
        platform = platform.with_circuit_breaker(restarts);
    }
    let registry = StoreRegistry::new(store.clone(), "registry.local");

    let mut orchestrator =
        ReleaseOrchestrator::new(resolver, store, Arc::new(platform), Arc::new(registry))
            .with_registry_settings(&config.registry)
            .with_secrets(Arc::new(EnvSecretStore));
    if let Some(cmd) = &options.test_cmd {
        orchestrator = orchestrator.with_tests(Arc::new(CommandTestExecutor::parse(cmd)?));
    }
    if let Some(dir) = options.definitions_dir {
        std::fs::create_dir_all(&dir)?;
        orchestrator = orchestrator.with_definitions_dir(dir);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling rollout");
            let _ = cancel_tx.send(true);
        }
    });

    let trigger = Trigger {
        environment: options.environment,
        commit: options.commit,
        branch: options.branch,
    };
    let result = orchestrator.execute(trigger, overrides, cancel_rx).await;
    ctrl_c.abort();

    let run = result?;
    print_run(&run);
    if run.outcome == RunOutcome::Failure {
        anyhow::bail!("release {} failed", run.id);
    }
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("run {} for {}", run.id, run.service);
    for stage in &run.stages {
        let mark = match stage.outcome {
            StageOutcome::Success => "✓",
            StageOutcome::Failure => "✗",
            StageOutcome::Skipped => "-",
        };
        println!("  {mark} {:<8} {:>7}ms", stage.name, stage.duration_ms);
        for artifact in &stage.artifacts {
            println!("      {}", artifact.image_uri());
        }
        if let Some(err) = &stage.error {
            println!("      {:?}: {}", err.kind, err.message);
            for case in &err.test_cases {
                println!(
                    "        {}: {}",
                    case.name,
                    case.message.as_deref().unwrap_or("failed")
                );
            }
            if err.requires_operator {
                println!("      operator intervention required");
            }
        }
    }
    println!("outcome: {:?}", run.outcome);
}

pub fn push(
    paths: &Paths,
    environment: &str,
    commit: &str,
    digest: Option<String>,
    file: Option<PathBuf>,
    host: &str,
) -> anyhow::Result<()> {
    let env = paths.environment(environment)?;
    let digest = match (digest, file) {
        (Some(raw), _) => Digest::parse(&raw)?,
        (None, Some(path)) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            content_digest(&bytes)
        }
        (None, None) => anyhow::bail!("one of --digest or --file is required"),
    };
    let tag = image_tag_for_commit(commit);
    let registry = StoreRegistry::new(paths.open_store()?, host);
    let artifact = registry.push(&env.repository, &tag, digest)?;
    info!(repository = %env.repository, %tag, "artifact recorded");
    println!("✓ {} tagged {tag}", artifact.image_uri());
    Ok(())
}

pub fn crash(paths: &Paths, environment: &str, version: u64) -> anyhow::Result<()> {
    let env = paths.environment(environment)?;
    let platform = LocalPlatform::new(paths.open_store()?);
    platform.crash_version(&env.service_key(), version)?;
    println!("✓ {} v{version} will crash on start", env.service_key());
    Ok(())
}
