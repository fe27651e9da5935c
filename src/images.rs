use serde::Deserialize;

/// Registry the third-party images are pulled from.
pub const SOURCE_REGISTRY: &str = "docker.io";

/// Reverse proxy running next to SonarQube in the container group.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Caddy,
    Nginx,
}

impl ProxyKind {
    pub fn repository(&self) -> &'static str {
        match self {
            ProxyKind::Caddy => "caddy",
            ProxyKind::Nginx => "nginx",
        }
    }
}

/// A container image to be promoted from the public source registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Logical name, e.g. `app` or `proxy`.
    pub name: String,
    /// Repository path, identical in source and destination.
    pub repository: String,
    pub tag: String,
}

impl ImageSpec {
    pub fn new(name: &str, repository: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Fully qualified reference in the public source registry.
    pub fn source(&self) -> String {
        let repository = if self.repository.contains('/') {
            self.repository.clone()
        } else {
            format!("library/{}", self.repository)
        };
        format!("{SOURCE_REGISTRY}/{repository}:{}", self.tag)
    }

    /// Repository and tag relative to a registry host.
    pub fn path(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Reference under the given destination registry host.
    pub fn destination(&self, registry_host: &str) -> String {
        format!("{registry_host}/{}", self.path())
    }
}

/// The fixed image set of a deployment: the application first, then the proxy.
pub fn image_set(app_version: &str, proxy: ProxyKind, proxy_version: &str) -> Vec<ImageSpec> {
    vec![
        ImageSpec::new("app", "sonarqube", app_version),
        ImageSpec::new("proxy", proxy.repository(), proxy_version),
    ]
}

/// Login server host of an Azure container registry.
pub fn registry_host(registry_name: &str) -> String {
    format!("{}.azurecr.io", registry_name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references() {
        let images = image_set("community", ProxyKind::Caddy, "alpine");
        assert_eq!(images[0].source(), "docker.io/library/sonarqube:community");
        assert_eq!(images[1].source(), "docker.io/library/caddy:alpine");
        assert_eq!(
            images[1].destination(&registry_host("ContosoACR")),
            "contosoacr.azurecr.io/caddy:alpine"
        );
    }

    #[test]
    fn namespaced_repositories_keep_their_namespace() {
        let image = ImageSpec::new("proxy", "nginxinc/nginx-unprivileged", "alpine");
        assert_eq!(image.source(), "docker.io/nginxinc/nginx-unprivileged:alpine");
    }

    #[test]
    fn proxy_choice_selects_repository() {
        let images = image_set("10-community", ProxyKind::Nginx, "1-alpine");
        assert_eq!(images[1].path(), "nginx:1-alpine");
        assert_eq!(images[0].path(), "sonarqube:10-community");
    }
}
