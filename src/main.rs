/// SonarQube deployer
use crate::Error::*;
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use thiserror::Error;
use log::{error, info};
use crate::docker::Docker;
use crate::images::ProxyKind;
use crate::promote::{Registry, Workflow};
use crate::registry::{AcrCli, Catalog, HttpRegistry};
use crate::secret::{Credentials, Secret};

mod arm;
mod az;
mod compose;
mod config;
mod deploy;
mod docker;
mod graph;
mod images;
mod naming;
mod promote;
mod registry;
mod secret;

/// Compose, promote images for, and deploy SonarQube on serverless container groups.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the deployment parameters file (TOML, or YAML by extension).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compose the resource graph for the configured feature flags and print it.
    Compose {
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Create or update every resource of the deployment in a resource group.
    Deploy {
        #[arg(long)]
        resource_group: String,

        /// Overrides the location from the parameters file.
        #[arg(long)]
        location: Option<String>,

        /// Validate the deployment without submitting it.
        #[arg(long)]
        validate_only: bool,

        #[arg(long, env = "SQD_DB_ADMIN_PASSWORD", hide_env_values = true)]
        db_admin_password: Option<Secret>,
    },
    /// Copy the application and proxy images into the private registry.
    Promote(PromoteArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Resolved resource graph as JSON, secrets redacted.
    Json,
    /// Resolved resource graph as YAML, secrets redacted.
    Yaml,
    /// Rendered deployment template.
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CatalogKind {
    /// `az acr repository show-tags`, using the current cloud login.
    Az,
    /// Registry HTTP API with the destination credentials.
    Http,
}

#[derive(Debug, clap::Args)]
struct PromoteArgs {
    /// Destination registry name. Defaults to the name in the parameters file.
    #[arg(long)]
    registry_name: Option<String>,

    /// Destination registry host. Defaults to `<registry-name>.azurecr.io`.
    #[arg(long)]
    registry_host: Option<String>,

    #[arg(long, value_enum, default_value_t = CatalogKind::Az)]
    catalog: CatalogKind,

    /// SonarQube image tag. Defaults to the version in the parameters file.
    #[arg(long)]
    app_version: Option<String>,

    #[arg(long, value_enum)]
    proxy: Option<ProxyKind>,

    #[arg(long)]
    proxy_version: Option<String>,

    /// Transfer images even when the destination already has the tag.
    #[arg(long)]
    force: bool,

    /// Container engine binary.
    #[arg(long, default_value = "docker")]
    engine: String,

    #[arg(long, env = "SQD_SOURCE_USERNAME")]
    source_username: String,

    #[arg(long, env = "SQD_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Secret,

    #[arg(long, env = "SQD_DESTINATION_USERNAME")]
    destination_username: String,

    #[arg(long, env = "SQD_DESTINATION_PASSWORD", hide_env_values = true)]
    destination_password: Secret,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::Error),

    #[error("{0}")]
    Compose(#[from] compose::Error),

    #[error("{0}")]
    Render(#[from] arm::Error),

    #[error("deploy: {0}")]
    Deploy(#[from] deploy::Error),

    #[error("{0}")]
    Promote(#[from] promote::Error),

    #[error("tag catalog: {0}")]
    TagCatalog(#[from] registry::Error),

    #[error("no destination registry: set registry.name or pass --registry-name")]
    MissingRegistryName,

    #[error("{0} image(s) failed to promote")]
    PromotionFailed(usize),

    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialize: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Read the parameters file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// Without `--config`, `sqd.toml` in the working directory is used if it exists.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "sqd.toml";

    let config_file = match &args.config {
        None => std::fs::metadata(DEFAULT_CONFIG_FILE)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then(|| DEFAULT_CONFIG_FILE.to_string()),
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        info!("Reading parameters from {config_file}");
        config::File::default_with_user_config_file(&config_file)?
    } else {
        config::File::default()
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    let cfg_file = read_config(&args)?;

    match args.command {
        Commands::Compose { format } => {
            let cfg = config::DeploymentConfig::new(&cfg_file, config::Overrides::default());
            let graph = compose::compose(&cfg)?;
            info!("Composed {} resources", graph.resources.len());
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&graph.view())?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&graph.view())?),
                Format::Template => {
                    let rendered = arm::render(&graph)?;
                    println!("{}", serde_json::to_string_pretty(&rendered.template)?);
                }
            }
            Ok(())
        }

        Commands::Deploy {
            resource_group,
            location,
            validate_only,
            db_admin_password,
        } => {
            let overrides = config::Overrides {
                location,
                db_admin_password,
            };
            let cfg = config::DeploymentConfig::new(&cfg_file, overrides);
            let graph = compose::compose(&cfg)?;

            let deploy_cfg = deploy::Config {
                resource_group,
                location: cfg.location.clone(),
                deployment_name: deploy::deployment_name(&cfg_file.name_prefix),
                storage_account: cfg.names.storage_account.clone(),
                validate_only,
            };
            let outputs = deploy::deploy(&deploy_cfg, &graph, &cfg.artifacts)?;
            for (name, value) in outputs {
                match value {
                    serde_json::Value::String(s) => println!("{name} = {s}"),
                    other => println!("{name} = {other}"),
                }
            }
            Ok(())
        }

        Commands::Promote(promote_args) => run_promotion(&cfg_file, promote_args).await,
    }
}

async fn run_promotion(cfg_file: &config::File, args: PromoteArgs) -> Result<(), Error> {
    let registry_name = args
        .registry_name
        .or_else(|| cfg_file.registry.name.clone())
        .filter(|name| !name.is_empty());

    let destination_host = match (&args.registry_host, &registry_name) {
        (Some(host), _) => host.clone(),
        (None, Some(name)) => images::registry_host(name),
        (None, None) => return Err(MissingRegistryName),
    };

    let destination = Registry {
        host: destination_host.clone(),
        credentials: Credentials {
            username: args.destination_username,
            password: args.destination_password,
        },
    };
    let source = Registry {
        host: images::SOURCE_REGISTRY.to_string(),
        credentials: Credentials {
            username: args.source_username,
            password: args.source_password,
        },
    };

    let catalog = match args.catalog {
        CatalogKind::Az => Catalog::Acr(AcrCli::new(registry_name.as_deref().ok_or(MissingRegistryName)?)),
        CatalogKind::Http => Catalog::Http(HttpRegistry::new(&destination_host, destination.credentials.clone())?),
    };
    let engine = Docker::new(args.engine);

    let images = images::image_set(
        args.app_version.as_deref().unwrap_or(&cfg_file.app.image_version),
        args.proxy.unwrap_or(cfg_file.proxy.kind),
        args.proxy_version.as_deref().unwrap_or(&cfg_file.proxy.image_version),
    );
    info!("Promoting {} images into {}", images.len(), destination_host);

    let workflow = Workflow {
        engine: &engine,
        catalog: &catalog,
        source: &source,
        destination: &destination,
        force: args.force,
    };
    let summary = workflow.run(&images).await?;
    print!("{summary}");

    if summary.succeeded() {
        Ok(())
    } else {
        Err(PromotionFailed(summary.failures()))
    }
}
