use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;

use crate::azure::AzCli;
use crate::compose::Services;
use crate::health::Budget;
use crate::provision::ControlPlane;
use crate::release::ReleaseTarget;
use crate::report::{DeploymentReport, Stage, Status};

mod azure;
mod compose;
mod config;
mod docker;
mod health;
mod pipeline;
mod provision;
mod release;
mod report;
mod spec;

/// Provision Azure infrastructure, build and push your application's
/// container images, release them onto App Service, and verify the result.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Root of the source code tree.
    #[arg(default_value = ".")]
    source_directory: String,

    /// Path to the deployment configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Application name; resource names are derived from it.
    #[arg(long)]
    app: Option<String>,

    /// Emit the deployment report as JSON instead of text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ensure all declared infrastructure exists, creating what is missing.
    Provision,
    /// Build the application and edge-proxy images and push them to the registry.
    BuildPush {
        /// Image tag to publish under.
        #[arg(long, default_value = "latest")]
        tag: String,
    },
    /// Point the running service at an already-pushed image tag and restart it.
    Release {
        #[arg(long, default_value = "latest")]
        tag: String,
    },
    /// Probe the service's health endpoint with bounded retries.
    Verify {
        /// URL to probe; defaults to the service's /health endpoint.
        #[arg(long)]
        url: Option<String>,

        /// Override the configured probe budget.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Provision, build-push, release and verify in sequence.
    Deploy {
        #[arg(long, default_value = "latest")]
        tag: String,

        /// Overall bound on the verification phase, in seconds.
        #[arg(long)]
        verify_timeout: Option<u64>,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error("resource spec: {0}")]
    Spec(#[from] spec::Error),

    #[error("compose services: {0}")]
    Compose(#[from] compose::Error),

    #[error("provider: {0}")]
    Provider(#[from] provision::ProviderError),

    #[error("docker: {0}")]
    Docker(#[from] docker::Error),

    #[error("release: {0}")]
    Release(#[from] release::Error),

    #[error("health check: {0}")]
    Health(#[from] health::Error),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

impl Error {
    /// 1=config, 2=provision, 3=build, 4=release, 5=health.
    fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigParse(_)
            | Error::Config(_)
            | Error::Spec(_)
            | Error::Compose(_)
            | Error::Filesystem(_) => 1,
            Error::Provider(_) => 2,
            Error::Docker(_) => 3,
            Error::Release(_) => 4,
            Error::Health(_) => 5,
        }
    }
}

/// Read configuration file from disk and merge it with the
/// `default.toml` built-in config.
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists on disk.
/// If it does, it is used implicitly. If not, we ignore any read errors.
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "deploy.toml";

    // Typically found in project root, e.g. ./deploy.toml
    let config_path = format!("{}/{}", args.source_directory, DEFAULT_CONFIG_FILE);

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(&config_path)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(config_path)
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::file::File::default_with_user_config_file(&config_file)?
    } else {
        config::file::File::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(err.exit_code())
        }
    }
}

async fn run() -> Result<i32, Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg_file = read_config(&args)?;
    let cfg = config::runtime::Config::new(&cfg_file, args.app.as_deref())?;

    info!("Application name: {}", cfg.app);
    info!("Resource group: {}", cfg.resource_group);

    match &args.command {
        Commands::Provision => {
            let specs = spec::load(&cfg)?;
            let cp: Arc<dyn ControlPlane> = Arc::new(AzCli);
            let results = provision::provision_all(cp, &specs).await?;

            let mut report = DeploymentReport::new();
            report.provision = results;
            report.finish();
            let failed = report.provision.iter().filter(|r| !r.ok()).count();
            print_report(&args, &report)?;
            Ok(if failed > 0 { 2 } else { 0 })
        }

        Commands::BuildPush { tag } => {
            let services = discover_services(&args)?;
            let registry = format!("{}.azurecr.io", cfg.registry);
            let artifacts = pipeline::build_stage(&cfg, &services, tag, &registry).await?;
            for artifact in &artifacts {
                info!("pushed {} image {}", artifact.role, artifact.registry_ref);
            }
            Ok(0)
        }

        Commands::Release { tag } => {
            let specs = spec::load(&cfg)?;
            let results = pipeline::inspect_endpoints(&AzCli, &specs);
            let artifact = docker::ImageArtifact {
                role: docker::Role::Application,
                registry_ref: docker::name::Config {
                    registry: pipeline::login_server(&cfg, &results),
                    app: cfg.app.clone(),
                    role: docker::Role::Application,
                    tag: tag.clone(),
                }
                .to_string(),
                tag: tag.clone(),
                historical_ref: None,
            };
            let target = ReleaseTarget {
                service_name: cfg.service.clone(),
                resource_group: cfg.resource_group.clone(),
                current_image_ref: None,
                environment: release::app_settings(&cfg, &results),
            };
            let target = release::release(&AzCli, target, &artifact)?;
            info!(
                "{} now runs {}",
                target.service_name,
                target.current_image_ref.as_deref().unwrap_or("<unknown>")
            );
            Ok(0)
        }

        Commands::Verify { url, max_attempts } => {
            let url = url.clone().unwrap_or_else(|| {
                format!("https://{}.azurewebsites.net/health", cfg.service)
            });
            let budget = Budget {
                max_attempts: max_attempts.unwrap_or(cfg.health.max_attempts),
                interval: cfg.health.interval,
                probe_timeout: cfg.health.probe_timeout,
            };
            let verdict = health::verify(&url, &budget, None).await?;
            for outcome in &verdict.outcomes {
                info!(
                    "probe {}: success={} status={:?} latency={}ms",
                    outcome.attempt, outcome.success, outcome.http_status, outcome.latency_ms
                );
            }
            if verdict.healthy() {
                info!("{url} is healthy");
                Ok(0)
            } else {
                warn!("{url} is not healthy");
                Ok(5)
            }
        }

        Commands::Deploy {
            tag,
            verify_timeout,
        } => {
            let services = discover_services(&args)?;
            let report = pipeline::deploy(pipeline::Params {
                cfg,
                services,
                tag: tag.clone(),
                verify_deadline: verify_timeout.map(Duration::from_secs),
            })
            .await?;
            print_report(&args, &report)?;
            Ok(report_exit_code(&report))
        }
    }
}

fn discover_services(args: &Cli) -> Result<Services, Error> {
    let compose_path = compose::detect_compose_file(&args.source_directory)?;
    info!("compose file detected at {compose_path}");
    Ok(Services::parse_file(&compose_path)?)
}

fn print_report(args: &Cli, report: &DeploymentReport) -> Result<(), Error> {
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).map_err(std::io::Error::other)?
        );
    } else {
        print!("{report}");
    }
    Ok(())
}

fn report_exit_code(report: &DeploymentReport) -> i32 {
    match report.failed_stage {
        Some(Stage::Provision) => 2,
        Some(Stage::Build) => 3,
        Some(Stage::Release) => 4,
        Some(Stage::Verify) => 5,
        None => match report.status() {
            Status::Succeeded => 0,
            // a partial success still signals the provisioning failure
            Status::PartiallySucceeded | Status::Failed => 2,
        },
    }
}
