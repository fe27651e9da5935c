use std::collections::BTreeSet;
use std::time::Duration;
use log::debug;
use serde::Deserialize;
use thiserror::Error;
use crate::az::{self, Az};
use crate::secret::Credentials;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Az(#[from] az::Error),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("deserialize tag list: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Read access to the destination registry's tag listings.
#[allow(async_fn_in_trait)]
pub trait TagCatalog {
    /// Check that the registry is reachable with the current credentials.
    async fn check_access(&self) -> Result<(), Error>;

    /// Tags present in `repository`. A repository that does not exist has no tags.
    async fn list_tags(&self, repository: &str) -> Result<BTreeSet<String>, Error>;
}

/// Tag listing through `az acr`, authenticated with the operator's cloud login.
pub struct AcrCli {
    name: String,
}

impl AcrCli {
    pub fn new(registry_name: &str) -> Self {
        Self {
            name: registry_name.to_string(),
        }
    }
}

impl TagCatalog for AcrCli {
    async fn check_access(&self) -> Result<(), Error> {
        let login_server = Az::new(["acr", "show", "--name", self.name.as_str(), "--query", "loginServer", "--output", "tsv"])
            .output()?;
        debug!("Registry {} is reachable at {}", self.name, login_server);
        Ok(())
    }

    async fn list_tags(&self, repository: &str) -> Result<BTreeSet<String>, Error> {
        let result = Az::new([
            "acr", "repository", "show-tags",
            "--name", self.name.as_str(),
            "--repository", repository,
            "--output", "json",
        ])
        .output();
        match result {
            Ok(stdout) => parse_tag_array(&stdout),
            Err(err) if err.is_not_found() => {
                debug!("Repository {} does not exist in {}", repository, self.name);
                Ok(BTreeSet::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_tag_array(json: &str) -> Result<BTreeSet<String>, Error> {
    if json.is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(serde_json::from_str::<Vec<String>>(json)?.into_iter().collect())
}

/// Tag listing through the registry HTTP API (`/v2/<repository>/tags/list`) with basic auth.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

#[derive(Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

impl HttpRegistry {
    pub fn new(host: &str, credentials: Credentials) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{host}")
        };
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, Error> {
        debug!("GET {url}");
        Ok(self
            .client
            .get(url)
            .basic_auth(&self.credentials.username, Some(self.credentials.password.expose()))
            .send()
            .await?)
    }
}

impl TagCatalog for HttpRegistry {
    async fn check_access(&self) -> Result<(), Error> {
        let url = format!("{}/v2/", self.base_url);
        let resp = self.get(&url).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Status {
                url,
                status: resp.status().as_u16(),
            })
        }
    }

    async fn list_tags(&self, repository: &str) -> Result<BTreeSet<String>, Error> {
        let url = format!("{}/v2/{repository}/tags/list?n=1000", self.base_url);
        let resp = self.get(&url).await?;
        let status = resp.status().as_u16();
        if status == 404 {
            return Ok(BTreeSet::new());
        }
        if !resp.status().is_success() {
            return Err(Error::Status { url, status });
        }
        let bytes = resp.bytes().await?;
        parse_tag_list(&bytes)
    }
}

fn parse_tag_list(bytes: &[u8]) -> Result<BTreeSet<String>, Error> {
    let list: TagList = serde_json::from_slice(bytes)?;
    Ok(list.tags.unwrap_or_default().into_iter().collect())
}

/// The catalog backend selected on the command line.
pub enum Catalog {
    Acr(AcrCli),
    Http(HttpRegistry),
}

impl TagCatalog for Catalog {
    async fn check_access(&self) -> Result<(), Error> {
        match self {
            Catalog::Acr(acr) => acr.check_access().await,
            Catalog::Http(http) => http.check_access().await,
        }
    }

    async fn list_tags(&self, repository: &str) -> Result<BTreeSet<String>, Error> {
        match self {
            Catalog::Acr(acr) => acr.list_tags(repository).await,
            Catalog::Http(http) => http.list_tags(repository).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Secret;

    #[test]
    fn parses_az_tag_arrays() {
        let tags = parse_tag_array(r#"["community", "10-community", "lts"]"#).unwrap();
        assert_eq!(tags.len(), 3);
        assert!(tags.contains("community"));
        assert!(parse_tag_array("").unwrap().is_empty());
        assert!(parse_tag_array("{").is_err());
    }

    #[test]
    fn parses_registry_tag_lists() {
        let tags = parse_tag_list(br#"{"name":"caddy","tags":["alpine","2-alpine"]}"#).unwrap();
        assert_eq!(tags, BTreeSet::from(["alpine".to_string(), "2-alpine".to_string()]));
        let empty = parse_tag_list(br#"{"name":"caddy","tags":null}"#).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn base_url_defaults_to_https() {
        let credentials = Credentials {
            username: "u".into(),
            password: Secret::new("p"),
        };
        let registry = HttpRegistry::new("contosoacr.azurecr.io", credentials.clone()).unwrap();
        assert_eq!(registry.base_url, "https://contosoacr.azurecr.io");
        let registry = HttpRegistry::new("http://localhost:5000/", credentials).unwrap();
        assert_eq!(registry.base_url, "http://localhost:5000");
    }

    /// Serve canned registry answers on a local port: `/v2/` is unauthorized,
    /// `sonarqube` has tags and every other repository is unknown.
    fn canned_registry() -> String {
        use std::io::{BufRead, BufReader, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                        break;
                    }
                }
                let path = request_line.split_whitespace().nth(1).unwrap_or_default();
                let (status, body) = match path {
                    "/v2/" => ("401 Unauthorized", r#"{"errors":[{"code":"UNAUTHORIZED"}]}"#),
                    "/v2/sonarqube/tags/list?n=1000" => ("200 OK", r#"{"name":"sonarqube","tags":["community","lts"]}"#),
                    _ => ("404 Not Found", r#"{"errors":[{"code":"NAME_UNKNOWN"}]}"#),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn http_registry_maps_status_codes() {
        let credentials = Credentials {
            username: "u".into(),
            password: Secret::new("p"),
        };
        let registry = HttpRegistry::new(&canned_registry(), credentials).unwrap();

        match registry.check_access().await {
            Err(Error::Status { status, url }) => {
                assert_eq!(status, 401);
                assert!(url.ends_with("/v2/"));
            }
            other => panic!("unexpected access check result: {other:?}"),
        }

        assert!(registry.list_tags("caddy").await.unwrap().is_empty());

        let tags = registry.list_tags("sonarqube").await.unwrap();
        assert_eq!(tags, BTreeSet::from(["community".to_string(), "lts".to_string()]));
    }

    #[test]
    fn not_found_detection() {
        let not_found = az::Error::Exit {
            command: "acr repository show-tags".into(),
            status: std::process::ExitStatus::default(),
            stderr: "ERROR: Error: repository caddy is not found.".into(),
        };
        assert!(not_found.is_not_found());
    }
}
