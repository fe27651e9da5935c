use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::collections::BTreeSet;
use thiserror::Error;
use crate::graph::Flag;
use crate::images::ProxyKind;
use crate::naming;
use crate::secret::Secret;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A sqd.toml parameters file, merged on top of the built-in defaults.
#[derive(Deserialize, Debug, Clone)]
pub struct File {
    pub description: Option<String>,
    pub location: String,
    pub name_prefix: String,
    pub use_private_registry: bool,
    pub create_registry: bool,
    pub enable_centralized_logging: bool,
    pub registry: Registry,
    pub logging: Logging,
    pub database: Database,
    pub app: App,
    pub proxy: Proxy,
    pub container: Container,
    pub storage: Storage,
    #[serde(default = "Vec::new")]
    pub artifacts: Vec<Artifact>,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Read a user parameters file and deep-merge it over the built-in defaults.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else as TOML.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        let user: toml::Value = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&contents)?
        } else {
            toml::from_str(&contents)?
        };
        Self::merged(user)
    }

    fn merged(user: toml::Value) -> Result<Self, Error> {
        let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG)?;
        merge(&mut base, user);
        Ok(base.try_into()?)
    }
}

/// Recursively merge `overlay` into `base`. Tables merge key by key,
/// any other value in `overlay` replaces the one in `base`.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Registry {
    /// Name of the private registry, created or pre-existing.
    pub name: Option<String>,
    pub sku: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Logging {
    pub workspace_name: Option<String>,
    pub retention_days: u32,
    pub sku: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Database {
    pub server_name: Option<String>,
    pub admin_username: String,
    /// Prefer the command line or environment over storing this in a file.
    pub admin_password: Option<Secret>,
    pub database_name: String,
    pub version: String,
    pub sku_name: String,
    pub sku_tier: String,
    pub storage_gb: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct App {
    pub image_version: String,
    pub cpu: f64,
    pub memory_gb: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Proxy {
    pub kind: ProxyKind,
    pub image_version: String,
    pub cpu: f64,
    pub memory_gb: f64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::Never => "Never",
            RestartPolicy::OnFailure => "OnFailure",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Container {
    pub group_name: Option<String>,
    pub dns_label: Option<String>,
    pub restart_policy: RestartPolicy,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Storage {
    pub account_name: Option<String>,
    pub sku: String,
    pub share_quota_gb: u32,
}

/// Which container of the group mounts an artifact's file share.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    App,
    Proxy,
}

/// A local file placed verbatim into a file share before the container group starts.
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Local path of the file to upload.
    pub source: String,
    #[serde_inline_default("sonarqube-conf".to_string())]
    pub share: String,
    /// Destination path inside the share.
    pub path: String,
    #[serde_inline_default(Target::App)]
    pub container: Target,
    #[serde_inline_default("/opt/sonarqube/conf".to_string())]
    pub mount_path: String,
}

/// Values supplied on the command line, taking precedence over the parameters file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub location: Option<String>,
    pub db_admin_password: Option<Secret>,
}

/// Resolved names of every resource the deployment may declare.
#[derive(Debug, Clone)]
pub struct Names {
    pub registry: Option<String>,
    pub identity: String,
    pub workspace: String,
    pub database_server: String,
    pub storage_account: String,
    pub container_group: String,
    pub dns_label: String,
}

/// Fully resolved deployment parameters. Consumed once per run.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub location: String,
    pub use_private_registry: bool,
    pub create_registry: bool,
    pub enable_centralized_logging: bool,
    pub names: Names,
    pub registry_sku: String,
    pub logging: Logging,
    pub database: Database,
    pub app: App,
    pub proxy: Proxy,
    pub restart_policy: RestartPolicy,
    pub storage: Storage,
    pub artifacts: Vec<Artifact>,
}

impl DeploymentConfig {
    pub fn new(file: &File, overrides: Overrides) -> Self {
        let location = overrides.location.unwrap_or_else(|| file.location.clone());
        let prefix = &file.name_prefix;

        let names = Names {
            registry: file.registry.name.clone().filter(|name| !name.is_empty()),
            identity: format!("{prefix}-identity"),
            workspace: file
                .logging
                .workspace_name
                .clone()
                .unwrap_or_else(|| format!("{prefix}-logs")),
            database_server: file
                .database
                .server_name
                .clone()
                .unwrap_or_else(|| naming::database_server_name(prefix)),
            storage_account: file
                .storage
                .account_name
                .clone()
                .unwrap_or_else(|| naming::storage_account_name(prefix, &format!("{prefix}/{location}"))),
            container_group: file
                .container
                .group_name
                .clone()
                .unwrap_or_else(|| format!("{prefix}-aci")),
            dns_label: file
                .container
                .dns_label
                .clone()
                .unwrap_or_else(|| naming::dns_label(prefix)),
        };

        let mut database = file.database.clone();
        if overrides.db_admin_password.is_some() {
            database.admin_password = overrides.db_admin_password;
        }

        Self {
            location,
            use_private_registry: file.use_private_registry,
            create_registry: file.create_registry,
            enable_centralized_logging: file.enable_centralized_logging,
            names,
            registry_sku: file.registry.sku.clone(),
            logging: file.logging.clone(),
            database,
            app: file.app.clone(),
            proxy: file.proxy.clone(),
            restart_policy: file.container.restart_policy,
            storage: file.storage.clone(),
            artifacts: file.artifacts.clone(),
        }
    }

    /// Feature flags that are switched on for this deployment.
    pub fn flags(&self) -> BTreeSet<Flag> {
        [
            (self.use_private_registry, Flag::PrivateRegistry),
            (self.create_registry, Flag::CreateRegistry),
            (self.enable_centralized_logging, Flag::CentralizedLogging),
        ]
        .into_iter()
        .filter_map(|(enabled, flag)| enabled.then_some(flag))
        .collect()
    }

    /// Fully qualified public host name of the container group.
    pub fn fqdn(&self) -> String {
        format!("{}.{}.azurecontainer.io", self.names.dns_label, self.location)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn load_default_configuration() {
        let cfg = File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert!(!cfg.use_private_registry);
        assert_eq!(cfg.proxy.kind, ProxyKind::Caddy);
        assert_eq!(cfg.container.restart_policy, RestartPolicy::Always);
        assert!(cfg.artifacts.is_empty());
    }

    #[test]
    fn user_file_overrides_nested_keys_only() {
        let user: toml::Value = toml::from_str(
            r#"
            use_private_registry = true
            [registry]
            name = "contosoacr"
            [database]
            storage_gb = 64
            [[artifacts]]
            source = "conf/sonar.properties"
            path = "sonar.properties"
            "#,
        )
        .unwrap();
        let cfg = File::merged(user).unwrap();
        assert!(cfg.use_private_registry);
        assert_eq!(cfg.registry.name.as_deref(), Some("contosoacr"));
        assert_eq!(cfg.registry.sku, "Basic");
        assert_eq!(cfg.database.storage_gb, 64);
        assert_eq!(cfg.database.admin_username, "sonaradmin");
        assert_eq!(
            cfg.artifacts,
            vec![Artifact {
                source: "conf/sonar.properties".into(),
                share: "sonarqube-conf".into(),
                path: "sonar.properties".into(),
                container: Target::App,
                mount_path: "/opt/sonarqube/conf".into(),
            }]
        );
    }

    #[test]
    fn yaml_parameter_files_are_accepted() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"enable_centralized_logging: true\nproxy:\n  kind: nginx\ncontainer:\n  restart_policy: Never\n",
        )
        .unwrap();
        let cfg = File::default_with_user_config_file(file.path().to_str().unwrap()).unwrap();
        assert!(cfg.enable_centralized_logging);
        assert_eq!(cfg.proxy.kind, ProxyKind::Nginx);
        assert_eq!(cfg.container.restart_policy, RestartPolicy::Never);
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = File::default_with_user_config_file("/nonexistent/sqd.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sqd.toml"));
    }

    #[test]
    fn overrides_take_precedence() {
        let cfg = DeploymentConfig::new(
            &File::default(),
            Overrides {
                location: Some("northeurope".into()),
                db_admin_password: Some(Secret::new("pw")),
            },
        );
        assert_eq!(cfg.location, "northeurope");
        assert_eq!(cfg.database.admin_password, Some(Secret::new("pw")));
        assert!(cfg.fqdn().ends_with(".northeurope.azurecontainer.io"));
        assert!(cfg.flags().is_empty());
        assert_eq!(cfg.names.registry, None);
    }
}
