use std::collections::BTreeMap;
use std::io::Write;
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use crate::arm::{self, Rendered};
use crate::az::{self, Az};
use crate::config::Artifact;
use crate::graph::{ResourceGraph, ResourceKind};
use crate::secret::Secret;

/// Where and how to submit a deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub resource_group: String,
    pub location: String,
    /// Prefix of the deployment names recorded by the cloud provider.
    pub deployment_name: String,
    pub storage_account: String,
    /// Stop after validation.
    pub validate_only: bool,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Az(#[from] az::Error),

    #[error("render template: {0}")]
    Render(#[from] arm::Error),

    #[error("missing secret parameters: {}", .0.join(", "))]
    MissingSecrets(Vec<String>),

    #[error("artifact {path}: {err}")]
    Artifact {
        err: std::io::Error,
        path: String,
    },

    #[error("deployment output: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Deployment name with a timestamp suffix, e.g. `sonarqube-20240101120000`.
pub fn deployment_name(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().format("%Y%m%d%H%M%S"))
}

/// Submit `graph`, uploading `artifacts` before the container group is created.
///
/// With artifacts, the storage sub-graph is deployed first, the files are
/// uploaded, and then the full graph is deployed.
pub fn deploy(cfg: &Config, graph: &ResourceGraph, artifacts: &[Artifact]) -> Result<BTreeMap<String, Value>, Error> {
    let rendered = arm::render(graph)?;
    let missing = rendered.missing_parameters();
    if !missing.is_empty() {
        return Err(Error::MissingSecrets(missing.into_iter().map(String::from).collect()));
    }

    ensure_resource_group(cfg)?;

    if cfg.validate_only {
        validate(cfg, &cfg.deployment_name, &rendered)?;
        info!("Deployment validated; nothing was submitted");
        return Ok(BTreeMap::new());
    }

    if !artifacts.is_empty() {
        for artifact in artifacts {
            std::fs::metadata(&artifact.source).map_err(|err| Error::Artifact {
                err,
                path: artifact.source.clone(),
            })?;
        }

        let storage = graph.closure(|resource| {
            matches!(resource.id.kind, ResourceKind::StorageAccount | ResourceKind::FileShare)
        });
        info!("Deploying {} storage resources ahead of artifact upload", storage.resources.len());
        let name = format!("{}-storage", cfg.deployment_name);
        let storage = arm::render(&storage)?;
        validate(cfg, &name, &storage)?;
        submit(cfg, &name, &storage)?;

        let key = storage_account_key(cfg)?;
        for artifact in artifacts {
            upload_artifact(cfg, &key, artifact)?;
        }
    }

    validate(cfg, &cfg.deployment_name, &rendered)?;
    submit(cfg, &cfg.deployment_name, &rendered)
}

pub fn ensure_resource_group(cfg: &Config) -> Result<(), Error> {
    info!("Ensuring resource group {} in {}", cfg.resource_group, cfg.location);
    Az::new([
        "group", "create",
        "--name", cfg.resource_group.as_str(),
        "--location", cfg.location.as_str(),
        "--output", "none",
    ])
    .output()?;
    Ok(())
}

/// Template and parameter files handed to `az`. Removed on drop.
struct DeploymentFiles {
    template: NamedTempFile,
    parameters: NamedTempFile,
}

impl DeploymentFiles {
    fn new(rendered: &Rendered) -> Result<Self, Error> {
        Ok(Self {
            template: write_json(&rendered.template)?,
            parameters: write_json(&rendered.parameters())?,
        })
    }

    fn args(&self, cfg: &Config, name: &str) -> Vec<String> {
        vec![
            "--resource-group".into(),
            cfg.resource_group.clone(),
            "--name".into(),
            name.to_string(),
            "--template-file".into(),
            self.template.path().to_string_lossy().to_string(),
            "--parameters".into(),
            format!("@{}", self.parameters.path().to_string_lossy()),
        ]
    }
}

fn write_json(value: &Value) -> Result<NamedTempFile, Error> {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
    file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    file.flush()?;
    Ok(file)
}

pub fn validate(cfg: &Config, name: &str, rendered: &Rendered) -> Result<(), Error> {
    info!("Validating deployment {name}");
    let files = DeploymentFiles::new(rendered)?;
    let mut args: Vec<String> = vec!["deployment".into(), "group".into(), "validate".into()];
    args.extend(files.args(cfg, name));
    args.extend(["--output".into(), "none".into()]);
    Az::new(args).output()?;
    Ok(())
}

/// Submit and wait for completion. Returns the deployment outputs.
pub fn submit(cfg: &Config, name: &str, rendered: &Rendered) -> Result<BTreeMap<String, Value>, Error> {
    info!("Submitting deployment {name} to resource group {}", cfg.resource_group);
    let files = DeploymentFiles::new(rendered)?;
    let mut args: Vec<String> = vec!["deployment".into(), "group".into(), "create".into()];
    args.extend(files.args(cfg, name));
    args.extend(["--output".into(), "json".into()]);
    let stdout = Az::new(args).output()?;
    let outputs = parse_outputs(&stdout)?;
    debug!("deployment {name} produced {} outputs", outputs.len());
    Ok(outputs)
}

#[derive(Deserialize)]
struct DeploymentResult {
    properties: DeploymentProperties,
}

#[derive(Deserialize)]
struct DeploymentProperties {
    #[serde(default)]
    outputs: Option<BTreeMap<String, OutputValue>>,
}

#[derive(Deserialize)]
struct OutputValue {
    value: Value,
}

pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, Value>, Error> {
    let result: DeploymentResult = serde_json::from_str(json)?;
    Ok(result
        .properties
        .outputs
        .unwrap_or_default()
        .into_iter()
        .map(|(name, output)| (name, output.value))
        .collect())
}

fn storage_account_key(cfg: &Config) -> Result<Secret, Error> {
    let key = Az::new([
        "storage", "account", "keys", "list",
        "--resource-group", cfg.resource_group.as_str(),
        "--account-name", cfg.storage_account.as_str(),
        "--query", "[0].value",
        "--output", "tsv",
    ])
    .output()?;
    Ok(Secret::new(key))
}

/// Upload a file verbatim into its file share.
pub fn upload_artifact(cfg: &Config, key: &Secret, artifact: &Artifact) -> Result<(), Error> {
    info!("Uploading {} to share {} as {}", artifact.source, artifact.share, artifact.path);
    Az::new([
        "storage", "file", "upload",
        "--account-name", cfg.storage_account.as_str(),
        "--share-name", artifact.share.as_str(),
        "--source", artifact.source.as_str(),
        "--path", artifact.path.as_str(),
    ])
    .secret_env("AZURE_STORAGE_KEY", key)
    .output()?;
    Ok(())
}
