//! Berth - compose-style projects on a Docker engine
//!
//! This is the main CLI entry point for Berth.

use berth::compose::{Orchestrator, ProcessEnv, ProjectManager, ProjectReport, ProjectStore};
use berth::config::BerthConfig;
use berth::engine::{engine_name, DockerEngine, EngineClient};
use berth::error::Result;
use berth::image::{PullQueue, RegistryAuth, StaticTokenProvider};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Berth - compose-style orchestrator for the Docker Engine API
#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A minimal compose-style orchestrator on the Docker Engine API", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a project's containers, networks and volumes
    Up {
        /// Project name
        project: String,
    },

    /// Remove a project's containers and networks
    Down {
        /// Project name
        project: String,
    },

    /// List a project's containers
    Ps {
        /// Project name
        project: String,
    },

    /// Pull an image through the pull queue
    Pull {
        /// Image reference
        image: String,
    },

    /// Print the Engine payloads a project translates to
    Translate {
        /// Project name
        project: String,
    },

    /// List project definitions
    Projects,

    /// Follow the engine event feed
    Events,
}

fn print_report(action: &str, report: &ProjectReport) {
    println!("Project {} {}", report.project, action);
    for (label, names) in [
        ("created", &report.created),
        ("replaced", &report.replaced),
        ("unchanged", &report.unchanged),
        ("removed", &report.removed),
        ("network created", &report.networks_created),
        ("network removed", &report.networks_removed),
        ("volume created", &report.volumes_created),
    ] {
        for name in names {
            println!("  {:<16} {}", label, name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BerthConfig::load(cli.config.as_deref())?;
    let engine = Arc::new(EngineClient::new(&config)?);
    let store = Arc::new(ProjectStore::from_config(&config));

    let auth = RegistryAuth::new(config.registries.clone(), StaticTokenProvider);
    let (queue, pulls) = PullQueue::new(engine.clone(), auth, config.history_limit);
    tokio::spawn(queue.run());

    let orchestrator = Orchestrator::new(engine.clone(), store.clone(), pulls.clone(), Arc::new(ProcessEnv));

    match cli.command {
        Commands::Up { project } => {
            let (manager, handle) = ProjectManager::new(orchestrator);
            tokio::spawn(manager.run());
            let report = handle.project_up(&project).await?;
            print_report("is up", &report);
        }

        Commands::Down { project } => {
            let (manager, handle) = ProjectManager::new(orchestrator);
            tokio::spawn(manager.run());
            let report = handle.project_down(&project).await?;
            print_report("is down", &report);
        }

        Commands::Ps { project } => {
            let statuses = orchestrator.project_status(&project).await?;
            println!(
                "{:<30} {:<16} {:<8} {:<10} {:<10} {:<20}",
                "NAME", "SERVICE", "REPLICA", "STATE", "HEALTH", "IMAGE"
            );
            for status in statuses {
                println!(
                    "{:<30} {:<16} {:<8} {:<10} {:<10} {:<20}",
                    status.name,
                    status.service.as_deref().unwrap_or("-"),
                    status
                        .replica
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    status.state,
                    status.health.as_deref().unwrap_or("-"),
                    status.image,
                );
            }
        }

        Commands::Pull { image } => {
            let mut progress = pulls.subscribe_progress();
            let printer = tokio::spawn(async move {
                let mut last = None;
                while let Ok(task) = progress.recv().await {
                    if last != Some(task.status) {
                        println!("{} {:?}", task.image_tag, task.status);
                        last = Some(task.status);
                    }
                }
            });
            let result = pulls.pull(&image).await;
            printer.abort();
            let task = result?;
            println!(
                "Pulled {} ({} layer(s){})",
                task.image_tag,
                task.layers.len(),
                if task.local_exists == Some(true) {
                    ", already present"
                } else {
                    ""
                }
            );
        }

        Commands::Translate { project } => {
            let plan = orchestrator.plan(&project)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }

        Commands::Projects => {
            store.load_all()?;
            println!("{:<24} {:<8} {:<10}", "PROJECT", "VALID", "SIZE");
            for project in store.list()? {
                println!(
                    "{:<24} {:<8} {:<10}",
                    project.name, project.valid, project.size
                );
                for reason in &project.reasons {
                    println!("  {}", reason);
                }
            }
        }

        Commands::Events => {
            let mut events = engine.monitor_events().await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            let event = event?;
                            let actor = event.actor.unwrap_or_default();
                            let name = actor
                                .attributes
                                .as_ref()
                                .and_then(|attributes| attributes.get("name"))
                                .cloned()
                                .unwrap_or_default();
                            println!(
                                "{} {} {} {} {}",
                                event.time.unwrap_or_default(),
                                engine_name(&event.typ).unwrap_or_default(),
                                event.action.unwrap_or_default(),
                                actor.id.unwrap_or_default(),
                                name,
                            );
                        }
                        None => break,
                    },
                }
            }
        }
    }

    Ok(())
}
