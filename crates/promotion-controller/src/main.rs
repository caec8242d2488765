//! golden-promote: deploy and roll back golden machine images
//!
//! Commands:
//! - deploy: promote the newest (or a named) available image into an environment
//! - rollback: return an environment to the previous (or a named) image
//! - status: show what an environment is running
//! - history: list recorded rollbacks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promotion_common::{format_timestamp, Environment, Image};
use promotion_controller::{
    backend::Cloud,
    rollout::{FleetRefresh, TemplatePromotion},
    selection::CurrentSource,
    AuditLog, BackendKind, Config, Controller, ControllerSettings, DeployOutcome, HttpBackend,
    MemoryBackend, RollbackOutcome, Seed, StatusReport, StdConsole,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "golden-promote")]
#[command(about = "Deploy and roll back golden images across environments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an image to an environment
    Deploy {
        /// dev, staging or production
        environment: String,

        /// Image to deploy (defaults to the newest available image)
        image_id: Option<String>,
    },

    /// Roll an environment back to a previous image
    Rollback {
        /// dev, staging or production
        environment: String,

        /// Image to roll back to (defaults to the second newest available image)
        image_id: Option<String>,

        /// Why the rollback is happening (prompted for when omitted)
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show the live image, template and fleet of an environment
    Status {
        environment: String,

        /// Instance refresh to report on
        #[arg(long)]
        refresh_id: Option<String>,
    },

    /// List rollback records of an environment, oldest first
    History { environment: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,promotion_controller=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    info!("Region: {}, backend: {:?}", config.region, config.backend);

    let controller = build_controller(&config).await?;
    let mut console = StdConsole;

    match cli.command {
        Commands::Deploy {
            environment,
            image_id,
        } => {
            let environment: Environment = environment.parse()?;
            match controller
                .deploy(environment, image_id.as_deref(), &mut console)
                .await?
            {
                DeployOutcome::Declined => {}
                DeployOutcome::Deployed(report) => {
                    println!(
                        "Deployed {} to {} at {}",
                        report.image_id,
                        report.environment,
                        format_timestamp(report.deployed_at)
                    );
                    print_rollout(&report.template, &report.refresh);
                }
            }
        }
        Commands::Rollback {
            environment,
            image_id,
            reason,
        } => {
            let environment: Environment = environment.parse()?;
            match controller
                .rollback(environment, image_id.as_deref(), reason.as_deref(), &mut console)
                .await?
            {
                RollbackOutcome::Declined => {}
                RollbackOutcome::RolledBack(report) => {
                    println!(
                        "Rolled back {} from {} to {}",
                        report.environment, report.from_image_id, report.to_image_id
                    );
                    print_rollout(&report.template, &report.refresh);
                    println!("Record: {}", report.record_path.display());
                }
            }
        }
        Commands::Status {
            environment,
            refresh_id,
        } => {
            let environment: Environment = environment.parse()?;
            let report = controller.status(environment, refresh_id.as_deref()).await?;
            print_status(&report);
        }
        Commands::History { environment } => {
            let environment: Environment = environment.parse()?;
            let records = controller.history(environment)?;
            if records.is_empty() {
                println!("No rollbacks recorded for {}", environment);
            }
            for record in records {
                println!(
                    "{}  {} -> {}  by {}: {}",
                    format_timestamp(record.timestamp),
                    record.from_image_id,
                    record.to_image_id,
                    record.initiated_by,
                    record.reason
                );
            }
        }
    }

    Ok(())
}

async fn build_controller(config: &Config) -> Result<Controller> {
    let cloud: Arc<dyn Cloud> = match config.backend {
        BackendKind::Http => {
            let backend = HttpBackend::new(
                &config.registry_url,
                &config.region,
                config.request_timeout(),
                config.max_retries,
            )?;
            match backend.health_check().await {
                Ok(true) => info!("Registry at {} is healthy", config.registry_url),
                Ok(false) => warn!("Registry at {} reports unhealthy", config.registry_url),
                Err(e) => warn!("Registry health check failed: {}", e),
            }
            Arc::new(backend)
        }
        BackendKind::Memory => {
            let seed = match &config.seed_file {
                Some(path) => Seed::from_file(path)
                    .with_context(|| format!("Failed to load seed file {}", path.display()))?,
                None => Seed::default(),
            };
            Arc::new(MemoryBackend::from_seed(seed))
        }
    };

    Ok(Controller::new(
        cloud,
        AuditLog::new(&config.audit_dir),
        ControllerSettings {
            operator: config.operator.clone(),
            lease_ttl: config.lease_ttl(),
            clear_stale_production_flag: config.clear_stale_production_flag,
        },
    ))
}

fn print_rollout(template: &TemplatePromotion, refresh: &FleetRefresh) {
    match template {
        TemplatePromotion::Promoted { template_id, version } => {
            println!("  Launch template: {} (default version {})", template_id, version)
        }
        TemplatePromotion::NoTemplate => println!("  Launch template: none"),
    }
    match refresh {
        FleetRefresh::Started { fleet_id, refresh_id } => {
            println!("  Instance refresh: {} on {}", refresh_id, fleet_id)
        }
        FleetRefresh::NoFleet => println!("  Instance refresh: none"),
    }
}

fn image_line(image: &Image) -> String {
    format!("{} (created {})", image.id, format_timestamp(image.creation_date))
}

fn print_status(report: &StatusReport) {
    println!("Environment: {}", report.environment);

    match &report.pointer {
        Some(pointer) => println!(
            "Pointer: {} (previous {}, set {} by {})",
            pointer.image_id,
            pointer.previous_image_id.as_deref().unwrap_or("none"),
            format_timestamp(pointer.updated_at),
            pointer.updated_by
        ),
        None => println!("Pointer: not set"),
    }

    match &report.current {
        Some((image, source)) => {
            let source = match source {
                CurrentSource::Pointer => "pointer",
                CurrentSource::ProductionTag => "Production tag",
            };
            println!("Current image: {} [from {}]", image_line(image), source);
        }
        None => println!("Current image: unknown"),
    }

    match &report.latest_available {
        Some(image) => println!("Latest available: {}", image_line(image)),
        None => println!("Latest available: none"),
    }

    match &report.template {
        Some(template) => match template.default() {
            Some(version) => println!(
                "Launch template: {} default version {} -> {}",
                template.id, version.number, version.image_id
            ),
            None => println!("Launch template: {} (no default version)", template.id),
        },
        None => println!("Launch template: none"),
    }

    match &report.fleet {
        Some(fleet) => println!(
            "Fleet group: {} (desired capacity {})",
            fleet.id, fleet.desired_capacity
        ),
        None => println!("Fleet group: none"),
    }

    if let Some(refresh) = &report.refresh {
        println!(
            "Instance refresh {}: {:?}, {}% complete",
            refresh.id, refresh.status, refresh.percentage_complete
        );
    }
}
