//! Conditional resource templates and their resolved graphs.
//!
//! A [`Template`] declares every resource the deployment can ever contain, each
//! guarded by a [`Condition`]. Before anything is resolved, [`Template::check`]
//! verifies that every reference points at a resource that exists whenever the
//! referencing site exists. [`Template::resolve`] then evaluates the conditions
//! against the enabled flags and yields a [`ResourceGraph`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use log::debug;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use crate::secret::Secret;

/// Feature toggles a resource or property can be conditional on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    PrivateRegistry,
    CreateRegistry,
    CentralizedLogging,
}

impl Display for Flag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Flag::PrivateRegistry => "use_private_registry",
            Flag::CreateRegistry => "create_registry",
            Flag::CentralizedLogging => "enable_centralized_logging",
        })
    }
}

/// Conjunction of flags. The empty conjunction always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition(BTreeSet<Flag>);

impl Condition {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn when(flag: Flag) -> Self {
        Self(BTreeSet::from([flag]))
    }

    pub fn and(mut self, flag: Flag) -> Self {
        self.0.insert(flag);
        self
    }

    pub fn union(&self, other: &Condition) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Whenever `self` holds, `other` holds too.
    pub fn implies(&self, other: &Condition) -> bool {
        other.0.is_subset(&self.0)
    }

    pub fn holds(&self, enabled: &BTreeSet<Flag>) -> bool {
        self.0.is_subset(enabled)
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("always");
        }
        let flags: Vec<String> = self.0.iter().map(Flag::to_string).collect();
        f.write_str(&flags.join(" && "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    LogWorkspace,
    ContainerRegistry,
    ManagedIdentity,
    RoleAssignment,
    PostgresServer,
    PostgresDatabase,
    PostgresFirewallRule,
    StorageAccount,
    FileShare,
    ContainerGroup,
}

impl ResourceKind {
    pub fn provider_type(&self) -> &'static str {
        match self {
            ResourceKind::LogWorkspace => "Microsoft.OperationalInsights/workspaces",
            ResourceKind::ContainerRegistry => "Microsoft.ContainerRegistry/registries",
            ResourceKind::ManagedIdentity => "Microsoft.ManagedIdentity/userAssignedIdentities",
            ResourceKind::RoleAssignment => "Microsoft.Authorization/roleAssignments",
            ResourceKind::PostgresServer => "Microsoft.DBforPostgreSQL/flexibleServers",
            ResourceKind::PostgresDatabase => "Microsoft.DBforPostgreSQL/flexibleServers/databases",
            ResourceKind::PostgresFirewallRule => "Microsoft.DBforPostgreSQL/flexibleServers/firewallRules",
            ResourceKind::StorageAccount => "Microsoft.Storage/storageAccounts",
            ResourceKind::FileShare => "Microsoft.Storage/storageAccounts/fileServices/shares",
            ResourceKind::ContainerGroup => "Microsoft.ContainerInstance/containerGroups",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::LogWorkspace => "2022-10-01",
            ResourceKind::ContainerRegistry => "2023-07-01",
            ResourceKind::ManagedIdentity => "2023-01-31",
            ResourceKind::RoleAssignment => "2022-04-01",
            ResourceKind::PostgresServer
            | ResourceKind::PostgresDatabase
            | ResourceKind::PostgresFirewallRule => "2022-12-01",
            ResourceKind::StorageAccount | ResourceKind::FileShare => "2023-01-01",
            ResourceKind::ContainerGroup => "2023-05-01",
        }
    }
}

/// Kind plus name. Child resources use `parent/child` names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.provider_type(), self.name)
    }
}

/// Property value of a resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Absent. Dropped from objects and arrays on resolution.
    Null,
    Literal(Value),
    /// Opaque pass-through value, submitted as a secure parameter.
    Secret { name: String, value: Option<Secret> },
    /// Runtime property of a declared resource, e.g. its host name.
    Reference { target: ResourceId, path: String },
    /// Key material of a declared resource.
    ListKeys { target: ResourceId, path: String },
    /// Full id of a declared resource.
    IdOf(ResourceId),
    /// A resource that is referenced by name but not declared by this deployment.
    /// `path` selects a runtime property; `None` means its id.
    Existing { target: ResourceId, path: Option<String> },
    /// Identity block attaching a declared user-assigned identity.
    UserAssigned(ResourceId),
    Concat(Vec<Expr>),
    If {
        condition: Condition,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Object(BTreeMap<String, Expr>),
    Array(Vec<Expr>),
}

impl Expr {
    pub fn reference(target: &ResourceId, path: &str) -> Self {
        Expr::Reference {
            target: target.clone(),
            path: path.to_string(),
        }
    }

    pub fn list_keys(target: &ResourceId, path: &str) -> Self {
        Expr::ListKeys {
            target: target.clone(),
            path: path.to_string(),
        }
    }

    pub fn secret(name: &str, value: Option<Secret>) -> Self {
        Expr::Secret {
            name: name.to_string(),
            value,
        }
    }

    pub fn if_else(condition: Condition, then: impl Into<Expr>, otherwise: impl Into<Expr>) -> Self {
        Expr::If {
            condition,
            then: Box::new(then.into()),
            otherwise: Box::new(otherwise.into()),
        }
    }

    /// Present only when `condition` holds.
    pub fn when(condition: Condition, then: impl Into<Expr>) -> Self {
        Self::if_else(condition, then, Expr::Null)
    }

    pub fn array<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Literal(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up a nested value by a `/`-separated path, like [`Value::pointer`].
    #[cfg(test)]
    pub fn pointer(&self, pointer: &str) -> Option<&Expr> {
        pointer
            .split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |expr, segment| match expr {
                Expr::Object(map) => map.get(segment),
                Expr::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// Evaluate conditionals against the enabled flags and drop absent values.
    pub fn resolve(&self, enabled: &BTreeSet<Flag>) -> Expr {
        match self {
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                if condition.holds(enabled) {
                    then.resolve(enabled)
                } else {
                    otherwise.resolve(enabled)
                }
            }
            Expr::Object(map) => Expr::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.resolve(enabled)))
                    .filter(|(_, value)| *value != Expr::Null)
                    .collect(),
            ),
            Expr::Array(items) => Expr::Array(
                items
                    .iter()
                    .map(|item| item.resolve(enabled))
                    .filter(|item| *item != Expr::Null)
                    .collect(),
            ),
            Expr::Concat(items) => {
                let items: Vec<Expr> = items.iter().map(|item| item.resolve(enabled)).collect();
                let literal: Option<String> = items.iter().map(Expr::as_str).collect();
                match literal {
                    Some(joined) => Expr::Literal(Value::String(joined)),
                    None => Expr::Concat(items),
                }
            }
            other => other.clone(),
        }
    }

    /// Declared resources this value reads from.
    fn collect_references(&self, into: &mut BTreeSet<ResourceId>) {
        match self {
            Expr::Reference { target, .. }
            | Expr::ListKeys { target, .. }
            | Expr::IdOf(target)
            | Expr::UserAssigned(target) => {
                into.insert(target.clone());
            }
            Expr::If { then, otherwise, .. } => {
                then.collect_references(into);
                otherwise.collect_references(into);
            }
            Expr::Concat(items) | Expr::Array(items) => {
                items.iter().for_each(|item| item.collect_references(into))
            }
            Expr::Object(map) => map.values().for_each(|value| value.collect_references(into)),
            Expr::Null | Expr::Literal(_) | Expr::Secret { .. } | Expr::Existing { .. } => {}
        }
    }

    /// Human readable rendition with secrets redacted.
    pub fn view(&self) -> Value {
        match self {
            Expr::Null => Value::Null,
            Expr::Literal(value) => value.clone(),
            Expr::Secret { name, .. } => json!(format!("<secret:{name}>")),
            Expr::Reference { target, path } => json!(format!("@{{{target}}}.{path}")),
            Expr::ListKeys { target, path } => json!(format!("@listKeys({target}).{path}")),
            Expr::IdOf(target) => json!(format!("@id({target})")),
            Expr::Existing { target, path: None } => json!(format!("@existing({target})")),
            Expr::Existing {
                target,
                path: Some(path),
            } => json!(format!("@existing({target}).{path}")),
            Expr::UserAssigned(target) => json!({
                "type": "UserAssigned",
                "identity": format!("@id({target})"),
            }),
            Expr::Concat(items) => Value::String(
                items
                    .iter()
                    .map(|item| match item.view() {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            Expr::If {
                condition,
                then,
                otherwise,
            } => json!({
                "if": condition.to_string(),
                "then": then.view(),
                "else": otherwise.view(),
            }),
            Expr::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.view()))
                    .collect(),
            ),
            Expr::Array(items) => Value::Array(items.iter().map(Expr::view).collect()),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(Value::String(value))
    }
}

impl From<&String> for Expr {
    fn from(value: &String) -> Self {
        Expr::from(value.as_str())
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Literal(Value::Bool(value))
    }
}

impl From<u32> for Expr {
    fn from(value: u32) -> Self {
        Expr::Literal(Value::from(value))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Literal(Value::from(value))
    }
}

/// Build an [`Expr::Object`] from `key => value` pairs.
macro_rules! object {
    ($($key:expr => $value:expr),* $(,)?) => {
        $crate::graph::Expr::Object(::std::collections::BTreeMap::from([
            $(($key.to_string(), $crate::graph::Expr::from($value))),*
        ]))
    };
}
pub(crate) use object;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("resource {0} is declared more than once")]
    Duplicate(ResourceId),

    #[error("{site} references {target}, which is not declared")]
    Dangling { site: String, target: ResourceId },

    #[error("{site} references {target} when `{context}`, but {target} is only declared when `{required}`")]
    ConditionallyAbsent {
        site: String,
        target: ResourceId,
        context: Condition,
        required: Condition,
    },
}

/// A resource declaration guarded by a condition.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub condition: Condition,
    /// Top-level fields of the declaration, e.g. `location`, `sku`, `properties`.
    pub body: BTreeMap<String, Expr>,
    /// Ordering-only edges. Each applies when its own condition holds as well.
    pub depends_on: Vec<(ResourceId, Condition)>,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(kind, name),
            condition: Condition::always(),
            body: BTreeMap::new(),
            depends_on: vec![],
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Expr>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn depends_on(self, target: &ResourceId) -> Self {
        self.depends_on_when(target, Condition::always())
    }

    pub fn depends_on_when(mut self, target: &ResourceId, condition: Condition) -> Self {
        self.depends_on.push((target.clone(), condition));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Output {
    pub name: String,
    pub condition: Condition,
    pub value: Expr,
}

/// Every resource a deployment may declare, with presence conditions.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub resources: Vec<ResourceDescriptor>,
    pub outputs: Vec<Output>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource and return its id for use in references.
    pub fn declare(&mut self, resource: ResourceDescriptor) -> ResourceId {
        let id = resource.id.clone();
        self.resources.push(resource);
        id
    }

    pub fn output(&mut self, name: &str, condition: Condition, value: impl Into<Expr>) {
        self.outputs.push(Output {
            name: name.to_string(),
            condition,
            value: value.into(),
        });
    }

    /// Verify that no reference or dependency can point at an absent resource.
    pub fn check(&self) -> Result<(), Error> {
        let mut index: HashMap<&ResourceId, &Condition> = HashMap::new();
        for resource in &self.resources {
            if index.insert(&resource.id, &resource.condition).is_some() {
                return Err(Error::Duplicate(resource.id.clone()));
            }
        }

        for resource in &self.resources {
            let site = resource.id.to_string();
            for (target, condition) in &resource.depends_on {
                check_target(&index, &site, &resource.condition.union(condition), target)?;
            }
            for value in resource.body.values() {
                check_expr(&index, &site, &resource.condition, value)?;
            }
        }

        for output in &self.outputs {
            let site = format!("output {}", output.name);
            check_expr(&index, &site, &output.condition, &output.value)?;
        }
        Ok(())
    }

    /// Keep what is present under `enabled`, evaluating every conditional.
    ///
    /// Call [`Template::check`] first; resolution assumes references are sound.
    pub fn resolve(&self, enabled: &BTreeSet<Flag>) -> ResourceGraph {
        let resources = self
            .resources
            .iter()
            .filter(|resource| resource.condition.holds(enabled))
            .map(|resource| {
                let body: BTreeMap<String, Expr> = resource
                    .body
                    .iter()
                    .map(|(key, value)| (key.clone(), value.resolve(enabled)))
                    .filter(|(_, value)| *value != Expr::Null)
                    .collect();

                let mut depends_on = BTreeSet::new();
                body.values().for_each(|value| value.collect_references(&mut depends_on));
                depends_on.extend(
                    resource
                        .depends_on
                        .iter()
                        .filter(|(_, condition)| condition.holds(enabled))
                        .map(|(target, _)| target.clone()),
                );
                depends_on.remove(&resource.id);

                debug!("resolved {} with {} dependencies", resource.id, depends_on.len());
                Resource {
                    id: resource.id.clone(),
                    body,
                    depends_on,
                }
            })
            .collect();

        let outputs = self
            .outputs
            .iter()
            .filter(|output| output.condition.holds(enabled))
            .map(|output| (output.name.clone(), output.value.resolve(enabled)))
            .collect();

        ResourceGraph { resources, outputs }
    }
}

fn check_target(
    index: &HashMap<&ResourceId, &Condition>,
    site: &str,
    context: &Condition,
    target: &ResourceId,
) -> Result<(), Error> {
    match index.get(target) {
        None => Err(Error::Dangling {
            site: site.to_string(),
            target: target.clone(),
        }),
        Some(required) if !context.implies(required) => Err(Error::ConditionallyAbsent {
            site: site.to_string(),
            target: target.clone(),
            context: context.clone(),
            required: (*required).clone(),
        }),
        Some(_) => Ok(()),
    }
}

fn check_expr(
    index: &HashMap<&ResourceId, &Condition>,
    site: &str,
    context: &Condition,
    expr: &Expr,
) -> Result<(), Error> {
    match expr {
        Expr::Reference { target, .. }
        | Expr::ListKeys { target, .. }
        | Expr::IdOf(target)
        | Expr::UserAssigned(target) => check_target(index, site, context, target),
        Expr::If {
            condition,
            then,
            otherwise,
        } => {
            check_expr(index, site, &context.union(condition), then)?;
            check_expr(index, site, context, otherwise)
        }
        Expr::Concat(items) | Expr::Array(items) => items
            .iter()
            .try_for_each(|item| check_expr(index, site, context, item)),
        Expr::Object(map) => map
            .values()
            .try_for_each(|value| check_expr(index, site, context, value)),
        Expr::Null | Expr::Literal(_) | Expr::Secret { .. } | Expr::Existing { .. } => Ok(()),
    }
}

/// A resolved, unconditional resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub body: BTreeMap<String, Expr>,
    pub depends_on: BTreeSet<ResourceId>,
}

#[cfg(test)]
impl Resource {
    pub fn pointer(&self, pointer: &str) -> Option<&Expr> {
        let pointer = pointer.trim_start_matches('/');
        let (head, rest) = pointer.split_once('/').unwrap_or((pointer, ""));
        self.body.get(head).and_then(|value| value.pointer(rest))
    }
}

/// Resources and outputs of one deployment run, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceGraph {
    pub resources: Vec<Resource>,
    pub outputs: BTreeMap<String, Expr>,
}

impl ResourceGraph {
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|resource| &resource.id == id)
    }

    #[cfg(test)]
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |resource| resource.id.kind == kind)
    }

    /// Sub-graph of the resources matching `include` plus everything they depend on.
    /// Outputs are not carried over.
    pub fn closure<F>(&self, include: F) -> ResourceGraph
    where
        F: Fn(&Resource) -> bool,
    {
        let mut wanted: BTreeSet<&ResourceId> = BTreeSet::new();
        let mut pending: Vec<&ResourceId> = self
            .resources
            .iter()
            .filter(|resource| include(resource))
            .map(|resource| &resource.id)
            .collect();
        while let Some(id) = pending.pop() {
            if wanted.insert(id) {
                if let Some(resource) = self.get(id) {
                    pending.extend(resource.depends_on.iter());
                }
            }
        }

        ResourceGraph {
            resources: self
                .resources
                .iter()
                .filter(|resource| wanted.contains(&resource.id))
                .cloned()
                .collect(),
            outputs: BTreeMap::new(),
        }
    }

    /// Human readable rendition with secrets redacted.
    pub fn view(&self) -> Value {
        let resources: Vec<Value> = self
            .resources
            .iter()
            .map(|resource| {
                json!({
                    "id": resource.id.to_string(),
                    "dependsOn": resource.depends_on.iter().map(ResourceId::to_string).collect::<Vec<_>>(),
                    "body": Expr::Object(resource.body.clone()).view(),
                })
            })
            .collect();
        let outputs: serde_json::Map<String, Value> = self
            .outputs
            .iter()
            .map(|(name, value)| (name.clone(), value.view()))
            .collect();
        json!({
            "resources": resources,
            "outputs": outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ResourceId {
        ResourceId::new(ResourceKind::ContainerRegistry, "acr")
    }

    fn template_with_registry() -> Template {
        let mut template = Template::new();
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerRegistry, "acr")
                .when(Condition::when(Flag::PrivateRegistry).and(Flag::CreateRegistry)),
        );
        template
    }

    #[test]
    fn condition_implication() {
        let both = Condition::when(Flag::PrivateRegistry).and(Flag::CreateRegistry);
        let private = Condition::when(Flag::PrivateRegistry);
        assert!(both.implies(&private));
        assert!(!private.implies(&both));
        assert!(private.implies(&Condition::always()));
        assert_eq!(both.to_string(), "use_private_registry && create_registry");
        assert_eq!(Condition::always().to_string(), "always");
    }

    #[test]
    fn unconditional_reference_to_conditional_resource_is_rejected() {
        let mut template = template_with_registry();
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci")
                .field("server", Expr::reference(&registry(), "loginServer")),
        );
        match template.check() {
            Err(Error::ConditionallyAbsent { target, context, .. }) => {
                assert_eq!(target, registry());
                assert_eq!(context, Condition::always());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn guarded_reference_is_accepted() {
        let mut template = template_with_registry();
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci").field(
                "server",
                Expr::if_else(
                    Condition::when(Flag::PrivateRegistry),
                    Expr::if_else(
                        Condition::when(Flag::CreateRegistry),
                        Expr::reference(&registry(), "loginServer"),
                        Expr::Existing {
                            target: registry(),
                            path: Some("loginServer".into()),
                        },
                    ),
                    "docker.io",
                ),
            ),
        );
        assert_eq!(template.check(), Ok(()));
    }

    #[test]
    fn dependency_conditions_widen_context() {
        let mut template = template_with_registry();
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci")
                .depends_on_when(&registry(), Condition::when(Flag::CreateRegistry)),
        );
        assert!(matches!(template.check(), Err(Error::ConditionallyAbsent { .. })));

        let mut template = template_with_registry();
        template.declare(ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci").depends_on_when(
            &registry(),
            Condition::when(Flag::CreateRegistry).and(Flag::PrivateRegistry),
        ));
        assert_eq!(template.check(), Ok(()));
    }

    #[test]
    fn dangling_references_and_duplicates_are_rejected() {
        let mut template = Template::new();
        template.output("server", Condition::always(), Expr::IdOf(registry()));
        assert!(matches!(template.check(), Err(Error::Dangling { .. })));

        let mut template = template_with_registry();
        template.declare(ResourceDescriptor::new(ResourceKind::ContainerRegistry, "acr"));
        assert_eq!(template.check(), Err(Error::Duplicate(registry())));
    }

    #[test]
    fn resolve_drops_absent_values_and_infers_dependencies() {
        let mut template = template_with_registry();
        let private_and_created = Condition::when(Flag::PrivateRegistry).and(Flag::CreateRegistry);
        template.declare(
            ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci")
                .field(
                    "properties",
                    object! {
                        "image" => Expr::if_else(
                            private_and_created.clone(),
                            Expr::Concat(vec![Expr::reference(&registry(), "loginServer"), "/app:1".into()]),
                            Expr::Concat(vec!["docker.io".into(), "/app:1".into()]),
                        ),
                        "credentials" => Expr::when(private_and_created.clone(), Expr::array([Expr::IdOf(registry())])),
                        "ports" => Expr::array([Expr::from(80u32), Expr::when(private_and_created, 443u32)]),
                    },
                ),
        );
        template.check().unwrap();

        let public = template.resolve(&BTreeSet::new());
        assert_eq!(public.resources.len(), 1);
        let group = &public.resources[0];
        assert_eq!(group.pointer("/properties/image").and_then(Expr::as_str), Some("docker.io/app:1"));
        assert_eq!(group.pointer("/properties/credentials"), None);
        assert_eq!(group.pointer("/properties/ports"), Some(&Expr::array([80u32])));
        assert!(group.depends_on.is_empty());

        let private = template.resolve(&BTreeSet::from([Flag::PrivateRegistry, Flag::CreateRegistry]));
        assert_eq!(private.resources.len(), 2);
        let group = private.get(&ResourceId::new(ResourceKind::ContainerGroup, "aci")).unwrap();
        assert!(matches!(group.pointer("/properties/image"), Some(Expr::Concat(_))));
        assert_eq!(group.depends_on, BTreeSet::from([registry()]));
    }

    #[test]
    fn literal_concatenations_collapse_after_resolution() {
        let image = Expr::Concat(vec![
            Expr::if_else(Condition::when(Flag::PrivateRegistry), "contosoacr.azurecr.io", "docker.io/library"),
            "/sonarqube:community".into(),
        ]);
        assert_eq!(
            image.resolve(&BTreeSet::from([Flag::PrivateRegistry])),
            Expr::from("contosoacr.azurecr.io/sonarqube:community")
        );
        assert_eq!(
            image.resolve(&BTreeSet::new()).as_str(),
            Some("docker.io/library/sonarqube:community")
        );

        let runtime = Expr::Concat(vec![Expr::reference(&registry(), "loginServer"), "/sonarqube".into()]);
        assert!(matches!(runtime.resolve(&BTreeSet::new()), Expr::Concat(items) if items.len() == 2));
    }

    #[test]
    fn closure_follows_dependencies() {
        let mut template = Template::new();
        let account = template.declare(ResourceDescriptor::new(ResourceKind::StorageAccount, "st"));
        let share = template.declare(
            ResourceDescriptor::new(ResourceKind::FileShare, "st/default/data").depends_on(&account),
        );
        template.declare(ResourceDescriptor::new(ResourceKind::ContainerGroup, "aci").depends_on(&share));
        let graph = template.resolve(&BTreeSet::new());

        let storage = graph.closure(|resource| resource.id.kind == ResourceKind::FileShare);
        let ids: Vec<&ResourceId> = storage.resources.iter().map(|r| &r.id).collect();
        assert_eq!(ids, vec![&account, &share]);
    }

    #[test]
    fn view_redacts_secrets() {
        let expr = object! {
            "password" => Expr::secret("dbPassword", Some(Secret::new("hunter2"))),
        };
        let view = expr.view().to_string();
        assert!(view.contains("<secret:dbPassword>"));
        assert!(!view.contains("hunter2"));
    }
}
