use cutover_core::{EnvironmentName, PipelineRun, ServiceStatus, epoch_millis};

use super::Paths;
use crate::OutputFormat;

pub fn status(paths: &Paths, environment: Option<&str>, format: OutputFormat) -> anyhow::Result<()> {
    let resolver = paths.resolver()?;
    let names: Vec<EnvironmentName> = match environment {
        Some(name) => vec![resolver.resolve(name)?.name],
        None => resolver.names(),
    };
    let store = paths.open_store()?;

    let mut rows = Vec::new();
    for name in names {
        let env = resolver.resolve(name.as_str())?;
        let key = env.service_key();
        let record = store.get_service_record(&key)?;
        let stable = store.get_stable_version(&key)?.map(|s| s.version);
        let lease = store.get_lease(&key.table_key())?;
        rows.push(serde_json::json!({
            "environment": name,
            "service": key.to_string(),
            "state": record.as_ref().map(|r| &r.state),
            "stable_version": stable,
            "lease": lease,
        }));

        if let OutputFormat::Text = format {
            println!("{name}  {key}");
            match record {
                Some(r) => {
                    let status = match &r.state.status {
                        ServiceStatus::Stable => "stable".to_string(),
                        ServiceStatus::InProgress => "in-progress".to_string(),
                        ServiceStatus::Failed { reason } => format!("failed: {reason}"),
                    };
                    println!(
                        "  active v{}  target v{}  healthy {}/{}  {status}",
                        version(r.state.active_version),
                        version(r.state.target_version),
                        r.state.healthy_count,
                        r.state.desired_count
                    );
                }
                None => println!("  not deployed"),
            }
            if let Some(v) = stable {
                println!("  last known-stable v{v}");
            }
            if let Some(lease) = lease.filter(|l| !l.is_expired(epoch_millis())) {
                println!("  deploying (lease held by {})", lease.owner);
            }
        }
    }

    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn version(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn history(paths: &Paths, environment: &str) -> anyhow::Result<()> {
    let env = paths.environment(environment)?;
    let store = paths.open_store()?;
    let stable = store
        .get_stable_version(&env.service_key())?
        .map(|s| s.version);
    let specs = store.list_task_specs(&env.task.family)?;
    if specs.is_empty() {
        println!("no task specifications for {}", env.task.family);
        return Ok(());
    }
    for spec in specs.iter().rev() {
        let marker = if Some(spec.version) == stable { "*" } else { " " };
        println!("{marker} {}:{:<4} {}", spec.family, spec.version, spec.image);
    }
    Ok(())
}

pub fn runs(
    paths: &Paths,
    environment: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let mut runs: Vec<PipelineRun> = match environment {
        Some(name) => {
            let env = paths.environment(name)?;
            store.list_pipeline_runs(&env.service_key())?
        }
        None => store.list_all_pipeline_runs()?,
    };
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
        OutputFormat::Text => {
            for run in &runs {
                let failed = run
                    .failed_stage()
                    .map(|s| format!(" at {}", s.name))
                    .unwrap_or_default();
                println!(
                    "{}  {:<24} {:<8} {:?}{failed}",
                    run.id,
                    run.service.to_string(),
                    short(&run.trigger.commit),
                    run.outcome
                );
            }
        }
    }
    Ok(())
}

fn short(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}

pub fn leases(paths: &Paths) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let now = epoch_millis();
    let leases = store.list_leases()?;
    if leases.is_empty() {
        println!("no leases");
    }
    for lease in leases {
        let state = if lease.is_expired(now) {
            "expired".to_string()
        } else {
            format!("{}s left", (lease.expires_at - now) / 1000)
        };
        println!("{}  {}  {state}", lease.key, lease.owner);
    }
    Ok(())
}

pub fn release_lease(paths: &Paths, environment: &str) -> anyhow::Result<()> {
    let env = paths.environment(environment)?;
    let store = paths.open_store()?;
    let key = env.service_key().table_key();
    if store.force_release_lease(&key)? {
        println!("✓ released lease on {key}");
    } else {
        println!("no lease on {key}");
    }
    Ok(())
}
