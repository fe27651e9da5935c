use log::debug;
use thiserror::Error;
use crate::config::{DeploymentConfig, Target};
use crate::graph::{object, Condition, Expr, Flag, ResourceDescriptor, ResourceGraph, ResourceId, ResourceKind, Template};
use crate::images::{image_set, ImageSpec, ProxyKind};
use crate::naming;

/// Built-in `AcrPull` role definition.
const ACR_PULL_ROLE: &str = "7f951dda-4ed3-4680-a7ca-43fe172d538d";

const APP_PORT: u32 = 9000;

/// Name of the secure parameter carrying the database administrator password.
pub const DATABASE_PASSWORD_PARAMETER: &str = "databaseAdminPassword";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    #[error("composition invariant violated: {0}")]
    CompositionInvariantViolation(#[from] crate::graph::Error),
}

/// Resolve a deployment configuration into its resource graph.
pub fn compose(cfg: &DeploymentConfig) -> Result<ResourceGraph, Error> {
    validate(cfg)?;
    let template = template(cfg);
    template.check()?;
    let flags = cfg.flags();
    debug!("resolving {} declared resources with flags {:?}", template.resources.len(), flags);
    Ok(template.resolve(&flags))
}

/// Reject flag combinations that cannot produce a meaningful deployment.
fn validate(cfg: &DeploymentConfig) -> Result<(), Error> {
    if cfg.create_registry && !cfg.use_private_registry {
        return Err(Error::ConfigurationConflict(
            "create_registry is set but use_private_registry is not; the registry would be created but never used".into(),
        ));
    }
    if cfg.use_private_registry && cfg.names.registry.is_none() {
        return Err(Error::ConfigurationConflict(
            "use_private_registry is set but no registry name is configured (registry.name)".into(),
        ));
    }
    let mounts = mounts(cfg);
    for artifact in &cfg.artifacts {
        let mounted = mounts.iter().find(|m| m.share == artifact.share);
        if let Some(m) = mounted.filter(|m| m.container != artifact.container || m.path != artifact.mount_path) {
            return Err(Error::ConfigurationConflict(format!(
                "share {} is mounted at {} in the {:?} container, but artifact {} expects {} in the {:?} container",
                m.share, m.path, m.container, artifact.source, artifact.mount_path, artifact.container
            )));
        }
    }
    Ok(())
}

/// Where a file share is mounted.
#[derive(Debug, Clone, PartialEq)]
struct Mount {
    share: String,
    container: Target,
    path: String,
}

fn mounts(cfg: &DeploymentConfig) -> Vec<Mount> {
    let mount = |share: &str, container: Target, path: &str| Mount {
        share: share.to_string(),
        container,
        path: path.to_string(),
    };
    let mut mounts = vec![
        mount("sonarqube-data", Target::App, "/opt/sonarqube/data"),
        mount("sonarqube-extensions", Target::App, "/opt/sonarqube/extensions"),
        mount("sonarqube-logs", Target::App, "/opt/sonarqube/logs"),
        match cfg.proxy.kind {
            ProxyKind::Caddy => mount("caddy-data", Target::Proxy, "/data"),
            ProxyKind::Nginx => mount("nginx-conf", Target::Proxy, "/etc/nginx/conf.d"),
        },
    ];
    for artifact in &cfg.artifacts {
        if !mounts.iter().any(|m| m.share == artifact.share) {
            mounts.push(mount(&artifact.share, artifact.container, &artifact.mount_path));
        }
    }
    mounts
}

/// Declare every resource the deployment may contain, conditions included.
pub fn template(cfg: &DeploymentConfig) -> Template {
    let mut template = Template::new();
    let names = &cfg.names;
    let location = cfg.location.as_str();

    let private = Condition::when(Flag::PrivateRegistry);
    let created = Condition::when(Flag::CreateRegistry);
    let logging = Condition::when(Flag::CentralizedLogging);

    let workspace = template.declare(
        ResourceDescriptor::new(ResourceKind::LogWorkspace, &names.workspace)
            .when(logging.clone())
            .field("location", location)
            .field(
                "properties",
                object! {
                    "sku" => object! { "name" => &cfg.logging.sku },
                    "retentionInDays" => cfg.logging.retention_days,
                },
            ),
    );

    // Registry wiring only exists when a registry name is known; without one,
    // use_private_registry is necessarily off.
    let registry = names.registry.as_ref().map(|registry_name| {
        let registry = ResourceId::new(ResourceKind::ContainerRegistry, registry_name);
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerRegistry, registry_name)
                .when(private.clone().and(Flag::CreateRegistry))
                .field("location", location)
                .field("sku", object! { "name" => &cfg.registry_sku })
                .field("properties", object! { "adminUserEnabled" => false }),
        );
        registry
    });

    let identity = registry.as_ref().map(|_| {
        template.declare(
            ResourceDescriptor::new(ResourceKind::ManagedIdentity, &names.identity)
                .when(private.clone())
                .field("location", location),
        )
    });

    // Either the registry declared above or an existing one referenced by name.
    let login_server = registry.as_ref().map(|registry| {
        Expr::if_else(
            created.clone(),
            Expr::reference(registry, "loginServer"),
            Expr::Existing {
                target: registry.clone(),
                path: Some("loginServer".into()),
            },
        )
    });

    let role_assignment = match (&registry, &identity) {
        (Some(registry), Some(identity)) => Some(
            template.declare(
                ResourceDescriptor::new(
                    ResourceKind::RoleAssignment,
                    naming::deterministic_guid(&[identity.name.as_str(), registry.name.as_str(), ACR_PULL_ROLE]),
                )
                .when(private.clone())
                .field(
                    "scope",
                    Expr::if_else(
                        created.clone(),
                        Expr::IdOf(registry.clone()),
                        Expr::Existing {
                            target: registry.clone(),
                            path: None,
                        },
                    ),
                )
                .field(
                    "properties",
                    object! {
                        "roleDefinitionId" => format!(
                            "[subscriptionResourceId('Microsoft.Authorization/roleDefinitions', '{ACR_PULL_ROLE}')]"
                        ),
                        "principalId" => Expr::reference(identity, "principalId"),
                        "principalType" => "ServicePrincipal",
                    },
                )
                .depends_on_when(registry, created.clone()),
            ),
        ),
        _ => None,
    };

    let server = template.declare(
        ResourceDescriptor::new(ResourceKind::PostgresServer, &names.database_server)
            .field("location", location)
            .field(
                "sku",
                object! {
                    "name" => &cfg.database.sku_name,
                    "tier" => &cfg.database.sku_tier,
                },
            )
            .field(
                "properties",
                object! {
                    "version" => &cfg.database.version,
                    "administratorLogin" => &cfg.database.admin_username,
                    "administratorLoginPassword" => Expr::secret(
                        DATABASE_PASSWORD_PARAMETER,
                        cfg.database.admin_password.clone(),
                    ),
                    "storage" => object! { "storageSizeGB" => cfg.database.storage_gb },
                    "backup" => object! {
                        "backupRetentionDays" => 7u32,
                        "geoRedundantBackup" => "Disabled",
                    },
                    "highAvailability" => object! { "mode" => "Disabled" },
                },
            ),
    );

    let database = template.declare(
        ResourceDescriptor::new(
            ResourceKind::PostgresDatabase,
            format!("{}/{}", names.database_server, cfg.database.database_name),
        )
        .field(
            "properties",
            object! {
                "charset" => "UTF8",
                "collation" => "en_US.utf8",
            },
        )
        .depends_on(&server),
    );

    let firewall = template.declare(
        ResourceDescriptor::new(
            ResourceKind::PostgresFirewallRule,
            format!("{}/AllowAllAzureServicesAndResourcesWithinAzureIps", names.database_server),
        )
        .field(
            "properties",
            object! {
                "startIpAddress" => "0.0.0.0",
                "endIpAddress" => "0.0.0.0",
            },
        )
        .depends_on(&server),
    );

    let storage = template.declare(
        ResourceDescriptor::new(ResourceKind::StorageAccount, &names.storage_account)
            .field("location", location)
            .field("kind", "StorageV2")
            .field("sku", object! { "name" => &cfg.storage.sku })
            .field(
                "properties",
                object! {
                    "minimumTlsVersion" => "TLS1_2",
                    "supportsHttpsTrafficOnly" => true,
                },
            ),
    );

    let mounts = mounts(cfg);
    let shares: Vec<ResourceId> = mounts
        .iter()
        .map(|mount| {
            template.declare(
                ResourceDescriptor::new(
                    ResourceKind::FileShare,
                    format!("{}/default/{}", names.storage_account, mount.share),
                )
                .field("properties", object! { "shareQuota" => cfg.storage.share_quota_gb })
                .depends_on(&storage),
            )
        })
        .collect();

    let images = image_set(&cfg.app.image_version, cfg.proxy.kind, &cfg.proxy.image_version);
    let image = |spec: &ImageSpec| -> Expr {
        match &login_server {
            Some(login_server) => Expr::if_else(
                private.clone(),
                Expr::Concat(vec![login_server.clone(), format!("/{}", spec.path()).into()]),
                spec.source(),
            ),
            None => spec.source().into(),
        }
    };
    let volume_mounts = |target: Target| {
        Expr::array(
            mounts
                .iter()
                .filter(|mount| mount.container == target)
                .map(|mount| object! { "name" => &mount.share, "mountPath" => &mount.path }),
        )
    };

    let app = object! {
        "name" => "sonarqube",
        "properties" => object! {
            "image" => image(&images[0]),
            "resources" => object! {
                "requests" => object! {
                    "cpu" => cfg.app.cpu,
                    "memoryInGB" => cfg.app.memory_gb,
                },
            },
            "ports" => Expr::array([object! { "port" => APP_PORT, "protocol" => "TCP" }]),
            "environmentVariables" => Expr::array([
                object! {
                    "name" => "SONAR_JDBC_URL",
                    "value" => Expr::Concat(vec![
                        "jdbc:postgresql://".into(),
                        Expr::reference(&server, "fullyQualifiedDomainName"),
                        format!(":5432/{}?sslmode=require", cfg.database.database_name).into(),
                    ]),
                },
                object! { "name" => "SONAR_JDBC_USERNAME", "value" => &cfg.database.admin_username },
                object! {
                    "name" => "SONAR_JDBC_PASSWORD",
                    "secureValue" => Expr::secret(
                        DATABASE_PASSWORD_PARAMETER,
                        cfg.database.admin_password.clone(),
                    ),
                },
                // Container instances cannot raise vm.max_map_count.
                object! {
                    "name" => "SONAR_SEARCH_JAVAADDITIONALOPTS",
                    "value" => "-Dnode.store.allow_mmap=false",
                },
            ]),
            "volumeMounts" => volume_mounts(Target::App),
        },
    };

    let proxy_command = match cfg.proxy.kind {
        ProxyKind::Caddy => Expr::array([
            "caddy".to_string(),
            "reverse-proxy".to_string(),
            "--from".to_string(),
            cfg.fqdn(),
            "--to".to_string(),
            format!("localhost:{APP_PORT}"),
        ]),
        ProxyKind::Nginx => Expr::Null,
    };
    let proxy = object! {
        "name" => cfg.proxy.kind.repository(),
        "properties" => object! {
            "image" => image(&images[1]),
            "command" => proxy_command,
            "resources" => object! {
                "requests" => object! {
                    "cpu" => cfg.proxy.cpu,
                    "memoryInGB" => cfg.proxy.memory_gb,
                },
            },
            "ports" => Expr::array([
                object! { "port" => 80u32, "protocol" => "TCP" },
                object! { "port" => 443u32, "protocol" => "TCP" },
            ]),
            "volumeMounts" => volume_mounts(Target::Proxy),
        },
    };

    let volumes = Expr::array(mounts.iter().map(|mount| {
        object! {
            "name" => &mount.share,
            "azureFile" => object! {
                "shareName" => &mount.share,
                "storageAccountName" => &names.storage_account,
                "storageAccountKey" => Expr::list_keys(&storage, "keys[0].value"),
            },
        }
    }));

    let registry_credentials = match (&login_server, &identity) {
        (Some(login_server), Some(identity)) => Expr::when(
            private.clone(),
            Expr::array([object! {
                "server" => login_server.clone(),
                "identity" => Expr::IdOf(identity.clone()),
            }]),
        ),
        _ => Expr::Null,
    };

    let mut group = ResourceDescriptor::new(ResourceKind::ContainerGroup, &names.container_group)
        .field("location", location)
        .field(
            "identity",
            match &identity {
                Some(identity) => Expr::when(private.clone(), Expr::UserAssigned(identity.clone())),
                None => Expr::Null,
            },
        )
        .field(
            "properties",
            object! {
                "osType" => "Linux",
                "restartPolicy" => cfg.restart_policy.as_str(),
                "containers" => Expr::array([app, proxy]),
                "imageRegistryCredentials" => registry_credentials,
                "ipAddress" => object! {
                    "type" => "Public",
                    "dnsNameLabel" => &names.dns_label,
                    "ports" => Expr::array([
                        object! { "port" => 80u32, "protocol" => "TCP" },
                        object! { "port" => 443u32, "protocol" => "TCP" },
                    ]),
                },
                "volumes" => volumes,
                "diagnostics" => Expr::when(
                    logging.clone(),
                    object! {
                        "logAnalytics" => object! {
                            "workspaceId" => Expr::reference(&workspace, "customerId"),
                            "workspaceKey" => Expr::list_keys(&workspace, "primarySharedKey"),
                        },
                    },
                ),
            },
        )
        .depends_on(&database)
        .depends_on(&firewall);
    for share in &shares {
        group = group.depends_on(share);
    }
    if let Some(role_assignment) = &role_assignment {
        // The identity must be allowed to pull before the group starts.
        group = group.depends_on_when(role_assignment, private.clone());
    }
    let group = template.declare(group);

    if let (Some(login_server), Some(identity)) = (login_server, &identity) {
        template.output("registryLoginServer", private.clone(), login_server);
        template.output("identityId", private.clone(), Expr::IdOf(identity.clone()));
    }
    template.output("sonarqubeFqdn", Condition::always(), Expr::reference(&group, "ipAddress.fqdn"));
    template.output(
        "databaseHost",
        Condition::always(),
        Expr::reference(&server, "fullyQualifiedDomainName"),
    );

    template
}
