use cutover_core::CutoverConfig;

use super::Paths;
use crate::OutputFormat;

pub fn init(paths: &Paths, app: &str, force: bool) -> anyhow::Result<()> {
    if paths.config.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            paths.config.display()
        );
    }
    let config = CutoverConfig::scaffold(app);
    std::fs::write(&paths.config, config.to_toml_string()?)?;
    println!("✓ Generated {}", paths.config.display());
    Ok(())
}

pub fn resolve(paths: &Paths, name: &str, format: OutputFormat) -> anyhow::Result<()> {
    let env = paths.environment(name)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&env)?),
        OutputFormat::Text => {
            println!("environment   {}", env.name);
            println!("branch        {}", env.branch);
            println!("region        {}", env.region);
            println!("service       {}", env.service_key());
            println!("repository    {}", env.repository);
            println!("task family   {}", env.task.family);
            println!(
                "replicas      {}..{} (cpu {}%, memory {}%)",
                env.scaling.min_replicas,
                env.scaling.max_replicas,
                env.scaling.cpu_target_percent,
                env.scaling.memory_target_percent
            );
            println!(
                "rollout       surge {} / unavailable {} / timeout {}s / grace {}s",
                env.rollout.max_surge,
                env.rollout.max_unavailable,
                env.rollout.stabilization_timeout_secs,
                env.rollout.health_grace_period_secs
            );
            if !env.task.secrets.is_empty() {
                let refs: Vec<&str> = env.task.secrets.values().map(String::as_str).collect();
                println!("secret refs   {}", refs.join(", "));
            }
        }
    }
    Ok(())
}
