use std::ffi::OsStr;
use std::process::{Command, ExitStatus, Stdio};
use log::debug;
use thiserror::Error;
use crate::secret::Secret;

#[derive(Error, Debug)]
pub enum Error {
    #[error("`az {command}` failed with exit code {status}: {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("az: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Whether the cloud provider reported that the queried object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Exit { stderr, .. } => {
                stderr.contains("NAME_UNKNOWN")
                    || stderr.contains("ResourceNotFound")
                    || stderr.to_lowercase().contains("not found")
            }
            Error::IOError(_) => false,
        }
    }
}

/// An invocation of the Azure command line client.
pub struct Az {
    command: Command,
    description: String,
}

impl Az {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new("az");
        let mut description = Vec::new();
        for arg in args {
            description.push(arg.as_ref().to_string_lossy().to_string());
            command.arg(arg);
        }
        command.arg("--only-show-errors");
        Self {
            command,
            description: description.join(" "),
        }
    }

    /// Pass a secret through the environment rather than the argument list.
    pub fn secret_env(mut self, key: &str, value: &Secret) -> Self {
        self.command.env(key, value.expose());
        self
    }

    /// Run to completion and return standard output.
    pub fn output(mut self) -> Result<String, Error> {
        debug!("Running az {}", self.description);
        let output = self
            .command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::Exit {
                command: self.description,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
