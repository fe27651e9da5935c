use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use log::debug;
use thiserror::Error;
use crate::docker::Error::IOError;
use crate::secret::Credentials;

#[derive(Error, Debug)]
pub enum Error {
    #[error("container engine is not reachable (exit code {0})")]
    Unreachable(ExitStatus),

    #[error("docker login failed with exit code {0}")]
    Login(ExitStatus),

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error("docker pull failed with exit code {0}")]
    Pull(ExitStatus),

    #[error("docker tag failed with exit code {0}")]
    Tag(ExitStatus),

    #[error("docker push failed with exit code {0}")]
    Push(ExitStatus),

    #[error("docker rmi failed with exit code {0}")]
    Remove(ExitStatus),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Local container engine operations used to move images between registries.
///
/// Every operation is synchronous and blocks until the engine command exits;
/// a non-zero exit status is a failure.
pub trait ContainerEngine {
    /// Check that the engine daemon answers.
    fn ping(&self) -> Result<(), Error>;
    fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), Error>;
    fn logout(&self, registry: &str) -> Result<(), Error>;
    fn pull(&self, reference: &str) -> Result<(), Error>;
    fn tag(&self, source: &str, destination: &str) -> Result<(), Error>;
    fn push(&self, reference: &str) -> Result<(), Error>;
    /// Remove a single local tag, leaving the underlying image and other tags alone.
    fn remove_local_tag(&self, reference: &str) -> Result<(), Error>;
}

/// The `docker` command line client, or a compatible one such as `podman`.
pub struct Docker {
    binary: String,
}

impl Docker {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }
}

/// Run a command with inherited output and map a non-zero exit status to an error.
fn run(command: &mut Command, error: fn(ExitStatus) -> Error) -> Result<(), Error> {
    command
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map(|exit_status| {
            if exit_status.success() {
                Ok(())
            } else {
                Err(error(exit_status))
            }
        })?
}

impl ContainerEngine for Docker {
    fn ping(&self) -> Result<(), Error> {
        debug!("Checking that {} is reachable", self.binary);
        let status = self
            .command()
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Unreachable(status))
        }
    }

    fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), Error> {
        debug!("Logging in to Docker registry {} as {}", registry, credentials.username);
        let mut child = self
            .command()
            .arg("login")
            .arg(registry)
            .arg("--username")
            .arg(&credentials.username)
            .arg("--password-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(IOError)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(credentials.password.expose().as_bytes())?;
        }
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Login(status))
        }
    }

    fn logout(&self, registry: &str) -> Result<(), Error> {
        debug!("Logging out of Docker registry {}", registry);
        run(self.command().arg("logout").arg(registry), Error::Logout)
    }

    fn pull(&self, reference: &str) -> Result<(), Error> {
        debug!("Pulling image {}", reference);
        run(self.command().arg("pull").arg(reference), Error::Pull)
    }

    fn tag(&self, source: &str, destination: &str) -> Result<(), Error> {
        debug!("Tagging image {} as {}", source, destination);
        run(self.command().arg("tag").arg(source).arg(destination), Error::Tag)
    }

    fn push(&self, reference: &str) -> Result<(), Error> {
        debug!("Pushing image {}", reference);
        run(self.command().arg("push").arg(reference), Error::Push)
    }

    fn remove_local_tag(&self, reference: &str) -> Result<(), Error> {
        debug!("Removing local tag {}", reference);
        run(self.command().arg("rmi").arg(reference), Error::Remove)
    }
}
