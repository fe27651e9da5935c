//! Copy third-party images from the public source registry into the private
//! destination registry, skipping images whose tag is already present.

use std::fmt::{Display, Formatter};
use log::{info, warn};
use thiserror::Error;
use crate::docker::{self, ContainerEngine};
use crate::images::ImageSpec;
use crate::registry::{self, TagCatalog};
use crate::secret::Credentials;

/// Failures that abort the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("preflight: {0}")]
    EngineUnreachable(docker::Error),

    #[error("preflight: destination registry {registry} is not accessible: {err}")]
    RegistryUnreachable {
        registry: String,
        err: registry::Error,
    },

    #[error("login to source registry {registry}: {err}")]
    SourceLogin {
        registry: String,
        err: docker::Error,
    },

    #[error("login to destination registry {registry}: {err}")]
    DestinationLogin {
        registry: String,
        err: docker::Error,
    },
}

/// Failure of a single step while promoting one image.
#[derive(Error, Debug)]
enum StepError {
    #[error("check existing tags: {0}")]
    CheckExists(registry::Error),

    #[error("pull: {0}")]
    Pull(docker::Error),

    #[error("tag: {0}")]
    Tag(docker::Error),

    #[error("push: {0}")]
    Push(docker::Error),
}

/// A registry host with the credentials to log in to it.
#[derive(Debug, Clone)]
pub struct Registry {
    pub host: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionResult {
    /// The destination already has the tag.
    Skipped,
    Transferred,
    Failed(String),
}

impl Display for PromotionResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionResult::Skipped => f.write_str("skipped (already present)"),
            PromotionResult::Transferred => f.write_str("transferred"),
            PromotionResult::Failed(reason) => write!(f, "FAILED: {reason}"),
        }
    }
}

/// Per-image outcomes of one run, in processing order.
#[derive(Debug, Default)]
pub struct Summary {
    pub entries: Vec<(ImageSpec, PromotionResult)>,
}

impl Summary {
    pub fn failures(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, result)| matches!(result, PromotionResult::Failed(_)))
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.failures() == 0
    }

    #[cfg(test)]
    pub fn results(&self) -> Vec<(&str, &PromotionResult)> {
        self.entries
            .iter()
            .map(|(image, result)| (image.name.as_str(), result))
            .collect()
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let width = self
            .entries
            .iter()
            .map(|(image, _)| image.path().len())
            .max()
            .unwrap_or(0);
        for (image, result) in &self.entries {
            writeln!(f, "{:<6} {:<width$}  {}", image.name, image.path(), result)?;
        }
        Ok(())
    }
}

/// Logs out of the source registry when dropped, whichever way the run ends.
struct LogoutGuard<'a, E: ContainerEngine> {
    engine: &'a E,
    registry: &'a str,
}

impl<E: ContainerEngine> Drop for LogoutGuard<'_, E> {
    fn drop(&mut self) {
        info!("Logging out of source registry {}", self.registry);
        if let Err(err) = self.engine.logout(self.registry) {
            warn!("logout from {} failed: {}", self.registry, err);
        }
    }
}

/// One promotion run.
///
/// Engine steps block the calling task until the engine command exits. Images are
/// processed one at a time, so nothing else runs on the runtime in the meantime.
pub struct Workflow<'a, E, C> {
    pub engine: &'a E,
    pub catalog: &'a C,
    pub source: &'a Registry,
    pub destination: &'a Registry,
    /// Transfer even when the destination already has the tag.
    pub force: bool,
}

impl<E, C> Workflow<'_, E, C>
where
    E: ContainerEngine,
    C: TagCatalog,
{
    /// Promote `images` in order.
    ///
    /// Returns `Err` only for failures that make every transfer pointless;
    /// per-image failures are recorded in the summary.
    pub async fn run(&self, images: &[ImageSpec]) -> Result<Summary, Error> {
        let _logout = LogoutGuard {
            engine: self.engine,
            registry: &self.source.host,
        };

        self.preflight().await?;

        info!("Logging in to source registry {}", self.source.host);
        self.engine
            .login(&self.source.host, &self.source.credentials)
            .map_err(|err| Error::SourceLogin {
                registry: self.source.host.clone(),
                err,
            })?;

        info!("Logging in to destination registry {}", self.destination.host);
        self.engine
            .login(&self.destination.host, &self.destination.credentials)
            .map_err(|err| Error::DestinationLogin {
                registry: self.destination.host.clone(),
                err,
            })?;

        let mut summary = Summary::default();
        for image in images {
            let result = match self.promote(image).await {
                Ok(result) => result,
                Err(err) => {
                    warn!("{}: {}", image.name, err);
                    PromotionResult::Failed(err.to_string())
                }
            };
            info!("{} {}: {}", image.name, image.path(), result);
            summary.entries.push((image.clone(), result));
        }

        info!(
            "{} of {} images promoted or already present",
            summary.entries.len() - summary.failures(),
            summary.entries.len()
        );
        Ok(summary)
    }

    async fn preflight(&self) -> Result<(), Error> {
        self.engine.ping().map_err(Error::EngineUnreachable)?;
        self.catalog
            .check_access()
            .await
            .map_err(|err| Error::RegistryUnreachable {
                registry: self.destination.host.clone(),
                err,
            })
    }

    async fn promote(&self, image: &ImageSpec) -> Result<PromotionResult, StepError> {
        let tags = self
            .catalog
            .list_tags(&image.repository)
            .await
            .map_err(StepError::CheckExists)?;
        if tags.contains(&image.tag) && !self.force {
            return Ok(PromotionResult::Skipped);
        }

        let source = image.source();
        let destination = image.destination(&self.destination.host);
        self.engine.pull(&source).map_err(StepError::Pull)?;
        self.engine.tag(&source, &destination).map_err(StepError::Tag)?;
        let pushed = self.engine.push(&destination).map_err(StepError::Push);

        // The source-tagged image stays behind as cache for later runs.
        if let Err(err) = self.engine.remove_local_tag(&destination) {
            warn!("could not remove local tag {}: {}", destination, err);
        }
        pushed?;
        Ok(PromotionResult::Transferred)
    }
}
