//! Rendering of resolved resource graphs into deployment templates.

use std::collections::BTreeMap;
use serde_json::{json, Map, Value};
use thiserror::Error;
use crate::graph::{Expr, ResourceGraph, ResourceId};
use crate::secret::Secret;

const TEMPLATE_SCHEMA: &str = "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";
const PARAMETERS_SCHEMA: &str = "https://schema.management.azure.com/schemas/2019-04-01/deploymentParameters.json#";
const CONTENT_VERSION: &str = "1.0.0.0";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("{site}: unresolved conditional value")]
    Unresolved { site: String },

    #[error("{site}: objects and arrays cannot be concatenated")]
    NotConcatenable { site: String },
}

/// Deployment template plus the values of its secure parameters.
pub struct Rendered {
    pub template: Value,
    secure: BTreeMap<String, Option<Secret>>,
}

impl Rendered {
    /// Secure parameters declared by the template without a value.
    pub fn missing_parameters(&self) -> Vec<&str> {
        self.secure
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Parameters document carrying the secret values. Never log this.
    pub fn parameters(&self) -> Value {
        let parameters: Map<String, Value> = self
            .secure
            .iter()
            .filter_map(|(name, value)| {
                value
                    .as_ref()
                    .map(|secret| (name.clone(), json!({ "value": secret.expose() })))
            })
            .collect();
        json!({
            "$schema": PARAMETERS_SCHEMA,
            "contentVersion": CONTENT_VERSION,
            "parameters": parameters,
        })
    }
}

/// Render a resolved graph into a deployment template.
pub fn render(graph: &ResourceGraph) -> Result<Rendered, Error> {
    let mut renderer = Renderer::default();

    let mut resources = Vec::with_capacity(graph.resources.len());
    for resource in &graph.resources {
        renderer.site = resource.id.to_string();
        let mut body = Map::new();
        body.insert("type".into(), json!(resource.id.kind.provider_type()));
        body.insert("apiVersion".into(), json!(resource.id.kind.api_version()));
        body.insert("name".into(), json!(resource.id.name));
        if !resource.depends_on.is_empty() {
            let depends_on: Vec<Value> = resource
                .depends_on
                .iter()
                .map(|id| json!(format!("[{}]", resource_id(id))))
                .collect();
            body.insert("dependsOn".into(), Value::Array(depends_on));
        }
        for (key, value) in &resource.body {
            body.insert(key.clone(), renderer.value(value)?);
        }
        resources.push(Value::Object(body));
    }

    let mut outputs = Map::new();
    for (name, value) in &graph.outputs {
        renderer.site = format!("output {name}");
        outputs.insert(
            name.clone(),
            json!({ "type": "string", "value": renderer.value(value)? }),
        );
    }

    let parameters: Map<String, Value> = renderer
        .secure
        .keys()
        .map(|name| (name.clone(), json!({ "type": "securestring" })))
        .collect();

    Ok(Rendered {
        template: json!({
            "$schema": TEMPLATE_SCHEMA,
            "contentVersion": CONTENT_VERSION,
            "parameters": parameters,
            "resources": resources,
            "outputs": outputs,
        }),
        secure: renderer.secure,
    })
}

/// `resourceId('<type>', '<segment>', ...)` expression for a resource.
fn resource_id(id: &ResourceId) -> String {
    let mut args = vec![quote(id.kind.provider_type())];
    args.extend(id.segments().map(quote));
    format!("resourceId({})", args.join(", "))
}

/// Template-language string literal.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Default)]
struct Renderer {
    site: String,
    secure: BTreeMap<String, Option<Secret>>,
}

impl Renderer {
    /// JSON value of an expression; runtime values become `[...]` expression strings.
    fn value(&mut self, expr: &Expr) -> Result<Value, Error> {
        Ok(match expr {
            Expr::Null => Value::Null,
            Expr::Literal(value) => value.clone(),
            Expr::Object(map) => {
                let mut object = Map::new();
                for (key, value) in map {
                    object.insert(key.clone(), self.value(value)?);
                }
                Value::Object(object)
            }
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::UserAssigned(identity) => {
                let mut identities = Map::new();
                identities.insert(format!("[{}]", resource_id(identity)), json!({}));
                json!({
                    "type": "UserAssigned",
                    "userAssignedIdentities": identities,
                })
            }
            other => Value::String(format!("[{}]", self.expression(other)?)),
        })
    }

    /// Expression-language rendition, without the surrounding brackets.
    fn expression(&mut self, expr: &Expr) -> Result<String, Error> {
        Ok(match expr {
            Expr::Literal(Value::String(s)) => quote(s),
            Expr::Literal(Value::Number(n)) => n.to_string(),
            Expr::Literal(Value::Bool(b)) => b.to_string(),
            Expr::Secret { name, value } => {
                self.secure.insert(name.clone(), value.clone());
                format!("parameters({})", quote(name))
            }
            Expr::Reference { target, path } => format!(
                "reference({}, {}).{path}",
                resource_id(target),
                quote(target.kind.api_version())
            ),
            Expr::ListKeys { target, path } => format!(
                "listKeys({}, {}).{path}",
                resource_id(target),
                quote(target.kind.api_version())
            ),
            Expr::IdOf(target) | Expr::Existing { target, path: None } => resource_id(target),
            Expr::Existing {
                target,
                path: Some(path),
            } => format!(
                "reference({}, {}).{path}",
                resource_id(target),
                quote(target.kind.api_version())
            ),
            Expr::Concat(items) => {
                let args = items
                    .iter()
                    .map(|item| self.expression(item))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("concat({})", args.join(", "))
            }
            Expr::If { .. } => {
                return Err(Error::Unresolved {
                    site: self.site.clone(),
                })
            }
            Expr::Null
            | Expr::Literal(_)
            | Expr::Object(_)
            | Expr::Array(_)
            | Expr::UserAssigned(_) => {
                return Err(Error::NotConcatenable {
                    site: self.site.clone(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::graph::{object, Condition, Flag, ResourceDescriptor, ResourceKind, Template};

    fn sample() -> ResourceGraph {
        let mut template = Template::new();
        let server = template.declare(
            ResourceDescriptor::new(ResourceKind::PostgresServer, "pg-sonar").field(
                "properties",
                object! {
                    "administratorLoginPassword" => Expr::secret("dbPassword", Some(Secret::new("hunter2"))),
                },
            ),
        );
        let database = template.declare(
            ResourceDescriptor::new(ResourceKind::PostgresDatabase, "pg-sonar/sonar").depends_on(&server),
        );
        let identity = template.declare(ResourceDescriptor::new(ResourceKind::ManagedIdentity, "id"));
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci")
                .field("identity", Expr::UserAssigned(identity))
                .field(
                    "url",
                    Expr::Concat(vec![
                        "jdbc:postgresql://".into(),
                        Expr::reference(&server, "fullyQualifiedDomainName"),
                        "/it's".into(),
                    ]),
                )
                .depends_on(&database),
        );
        template.output("databaseHost", Condition::always(), Expr::reference(&server, "fullyQualifiedDomainName"));
        template.check().unwrap();
        template.resolve(&BTreeSet::new())
    }

    #[test]
    fn renders_resources_with_dependencies() {
        let rendered = render(&sample()).unwrap();
        let template = &rendered.template;
        assert_eq!(template["resources"].as_array().unwrap().len(), 4);
        let database = &template["resources"][1];
        assert_eq!(database["type"], "Microsoft.DBforPostgreSQL/flexibleServers/databases");
        assert_eq!(
            database["dependsOn"][0],
            "[resourceId('Microsoft.DBforPostgreSQL/flexibleServers', 'pg-sonar')]"
        );
        assert_eq!(
            template["resources"][0]["dependsOn"],
            Value::Null,
            "resources without dependencies carry no dependsOn"
        );
    }

    #[test]
    fn renders_runtime_values_as_expressions() {
        let rendered = render(&sample()).unwrap();
        let group = &rendered.template["resources"][3];
        assert_eq!(
            group["url"],
            "[concat('jdbc:postgresql://', reference(resourceId('Microsoft.DBforPostgreSQL/flexibleServers', 'pg-sonar'), '2022-12-01').fullyQualifiedDomainName, '/it''s')]"
        );
        assert_eq!(group["identity"]["type"], "UserAssigned");
        assert!(group["identity"]["userAssignedIdentities"]
            ["[resourceId('Microsoft.ManagedIdentity/userAssignedIdentities', 'id')]"]
            .is_object());
        assert_eq!(
            rendered.template["outputs"]["databaseHost"]["type"],
            "string"
        );
    }

    #[test]
    fn secrets_only_appear_in_parameters() {
        let rendered = render(&sample()).unwrap();
        let template = rendered.template.to_string();
        assert!(!template.contains("hunter2"));
        assert_eq!(rendered.template["parameters"]["dbPassword"]["type"], "securestring");
        assert_eq!(
            rendered.template["resources"][0]["properties"]["administratorLoginPassword"],
            "[parameters('dbPassword')]"
        );
        assert_eq!(rendered.parameters()["parameters"]["dbPassword"]["value"], "hunter2");
        assert!(rendered.missing_parameters().is_empty());
    }

    #[test]
    fn missing_secret_values_are_reported() {
        let mut template = Template::new();
        template.declare(
            ResourceDescriptor::new(ResourceKind::PostgresServer, "pg")
                .field("password", Expr::secret("dbPassword", None)),
        );
        let rendered = render(&template.resolve(&BTreeSet::new())).unwrap();
        assert_eq!(rendered.missing_parameters(), vec!["dbPassword"]);
        assert!(rendered.parameters()["parameters"].as_object().unwrap().is_empty());
    }

    #[test]
    fn unresolved_conditionals_are_rejected() {
        let mut template = Template::new();
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci")
                .field("tag", Expr::when(Condition::when(Flag::PrivateRegistry), "x")),
        );
        // Bypass resolution to feed the renderer a raw template body.
        let graph = ResourceGraph {
            resources: vec![crate::graph::Resource {
                id: template.resources[0].id.clone(),
                body: template.resources[0].body.clone(),
                depends_on: BTreeSet::new(),
            }],
            outputs: BTreeMap::new(),
        };
        assert!(matches!(render(&graph), Err(Error::Unresolved { .. })));
    }

    #[test]
    fn composed_deployment_renders() {
        use crate::config::{DeploymentConfig, File, Overrides};
        let mut file = File::default();
        file.use_private_registry = true;
        file.create_registry = true;
        file.enable_centralized_logging = true;
        file.registry.name = Some("contosoacr".into());
        let cfg = DeploymentConfig::new(&file, Overrides::default());
        let rendered = render(&crate::compose::compose(&cfg).unwrap()).unwrap();
        assert_eq!(
            rendered.missing_parameters(),
            vec![crate::compose::DATABASE_PASSWORD_PARAMETER]
        );
        let outputs = rendered.template["outputs"].as_object().unwrap();
        assert!(outputs.contains_key("registryLoginServer"));
        assert!(outputs.contains_key("identityId"));
    }
}
