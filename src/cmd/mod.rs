//! Operator subcommands

use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Subcommand;

use dockerpilot::{Configuration, DockerPilot, Environment, Strategy};

#[derive(Subcommand)]
pub enum Commands {
    /// List or test registered hosts
    Hosts {
        #[command(subcommand)]
        action: HostAction,
    },

    /// Show the pipeline state per environment
    Envs {
        /// Host id to inspect
        #[arg(long, default_value = "local")]
        host: String,
    },

    /// Write the deployment config for a container and target environment
    Prepare {
        container: String,
        /// Target environment (dev, staging, prod)
        env: String,
        #[arg(long, default_value = "local")]
        host: String,
    },

    /// Promote a container to the next environment
    Promote {
        container: String,
        /// Source environment
        from: String,
        /// Target environment
        to: String,
        #[arg(long)]
        skip_backup: bool,
        /// Strategy override (quick, rolling, blue-green, canary)
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long, default_value = "local")]
        host: String,
    },

    /// Migrate a container between hosts
    Migrate {
        container: String,
        /// Source host id
        source: String,
        /// Target host id
        target: String,
        #[arg(long)]
        include_data: bool,
        #[arg(long)]
        stop_source: bool,
    },

    /// Show recent deployment history
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum HostAction {
    /// List registered hosts
    List,
    /// Open a connection to a host and ping its daemon
    Test { id: String },
}

pub async fn run(config_path: &str, command: Commands) -> Result<()> {
    let config = Configuration::load(config_path)?;
    let pilot = DockerPilot::open(config)?;

    match command {
        Commands::Hosts { action } => match action {
            HostAction::List => {
                for host in pilot.list_hosts() {
                    println!(
                        "{:<16} {:<24} {}@{}:{}",
                        host.id, host.name, host.username, host.hostname, host.port
                    );
                }
            }
            HostAction::Test { id } => {
                pilot.test_host_id(&id).await?;
                println!("{}: ok", id);
            }
        },

        Commands::Envs { host } => {
            let session = pilot.session();
            session.select_host(&host);
            for report in pilot.inspect_environments(&session).await? {
                println!(
                    "{:<8} {:<10} {}/{} running  {}",
                    report.environment.to_string(),
                    report.status,
                    report.container_count_running,
                    report.container_count_total,
                    report.containers.join(", ")
                );
            }
        }

        Commands::Prepare { container, env, host } => {
            let target: Environment = env.parse().map_err(|e| anyhow!("{}", e))?;
            let session = pilot.session();
            session.select_host(&host);
            let (path, descriptor) = pilot.prepare_config(&session, &container, target).await?;
            println!("{} -> {}", descriptor.container_name, path.display());
        }

        Commands::Promote {
            container,
            from,
            to,
            skip_backup,
            strategy,
            host,
        } => {
            let from: Environment = from.parse().map_err(|e| anyhow!("{}", e))?;
            let to: Environment = to.parse().map_err(|e| anyhow!("{}", e))?;
            let session = pilot.session();
            session.select_host(&host);

            match strategy.as_deref() {
                None => pilot.promote_one(&session, from, to, &container, skip_backup)?,
                Some(name) => {
                    let strategy = parse_strategy(name)?;
                    pilot.promote_one_with(&session, from, to, &container, skip_backup, strategy)?
                }
            }

            watch(&pilot, &container).await;
        }

        Commands::Migrate {
            container,
            source,
            target,
            include_data,
            stop_source,
        } => {
            pilot.migrate(&container, &source, &target, include_data, stop_source)?;
            watch(&pilot, &container).await;
        }

        Commands::History { limit } => {
            for entry in pilot.deployment_history(limit).await? {
                println!(
                    "{}  {:<10} {:<9} {:<24} {}ms  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.strategy,
                    match entry.status {
                        dockerpilot::engine::DeployStatus::Success => "success",
                        dockerpilot::engine::DeployStatus::Failed => "failed",
                    },
                    entry.container_name,
                    entry.duration_ms,
                    entry.output.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

fn parse_strategy(name: &str) -> Result<Strategy> {
    match name {
        "quick" => Ok(Strategy::Quick),
        "rolling" => Ok(Strategy::Rolling),
        "blue-green" => Ok(Strategy::BlueGreen),
        "canary" => Ok(Strategy::Canary),
        other => Err(anyhow!("unknown strategy: {}", other)),
    }
}

/// Poll the progress record until the operation reaches a terminal stage.
async fn watch(pilot: &DockerPilot, container: &str) {
    let mut last = String::new();
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(record) = pilot.progress(container) else {
            break;
        };

        let line = format!("[{:>3}%] {} {}", record.progress, record.stage, record.message);
        if line != last {
            println!("{}", line);
            last = line;
        }

        if record.stage.is_terminal() {
            break;
        }
    }
}
