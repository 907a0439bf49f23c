//! Container backends.
//!
//! The session only needs a narrow capability set from whatever engine runs
//! the container: look it up, create/start/remove it, run commands in it,
//! and (optionally) copy a file into it. [`ContainerBackend`] is that
//! contract; [`CliBackend`] drives docker-compatible CLIs and
//! [`DaytonaBackend`] drives the Daytona CLI.

mod cli;
mod daytona;
mod error;

pub use cli::CliBackend;
pub use daytona::DaytonaBackend;
pub use error::{ContainerError, ContainerResult};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Child;

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Podman,
    /// Rancher Desktop through its bundled `nerdctl`.
    Rancher,
    /// OrbStack through `docker --context orbstack`.
    Orbstack,
    Daytona,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Podman => "podman",
            BackendKind::Rancher => "rancher",
            BackendKind::Orbstack => "orbstack",
            BackendKind::Daytona => "daytona",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "podman" => Ok(BackendKind::Podman),
            "rancher" | "nerdctl" => Ok(BackendKind::Rancher),
            "orbstack" => Ok(BackendKind::Orbstack),
            "daytona" => Ok(BackendKind::Daytona),
            other => Err(ContainerError::InvalidInput(format!(
                "unknown backend '{other}'"
            ))),
        }
    }
}

/// Build the backend for `kind`.
pub fn for_kind(kind: BackendKind) -> Arc<dyn ContainerBackend> {
    match kind {
        BackendKind::Daytona => Arc::new(DaytonaBackend::new()),
        other => Arc::new(CliBackend::new(other)),
    }
}

/// Whether a named container exists and is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Missing,
    Running,
    Stopped,
}

impl ContainerStatus {
    /// Interpret an engine state string such as `running` or `exited`.
    pub fn from_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "" => ContainerStatus::Missing,
            "running" | "started" | "restarting" => ContainerStatus::Running,
            _ => ContainerStatus::Stopped,
        }
    }
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

/// A memory-backed mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmpfsMount {
    pub path: String,
    pub mode: u32,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workdir: Option<String>,
    pub mounts: Vec<Mount>,
    pub tmpfs: Vec<TmpfsMount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn mount(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            container: container.into(),
            read_only: false,
        });
        self
    }

    pub fn mount_read_only(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            container: container.into(),
            read_only: true,
        });
        self
    }

    pub fn tmpfs(mut self, path: impl Into<String>, mode: u32) -> Self {
        self.tmpfs.push(TmpfsMount {
            path: path.into(),
            mode,
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Validate everything that ends up on an engine command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;
        if let Some(ref dir) = self.workdir {
            validate_path(dir, "working directory")?;
        }
        for mount in &self.mounts {
            validate_path(&mount.host, "host mount")?;
            validate_path(&mount.container, "container mount")?;
        }
        for tmpfs in &self.tmpfs {
            validate_path(&tmpfs.path, "tmpfs")?;
        }
        for key in self.env.keys() {
            validate_env_key(key)?;
        }
        Ok(())
    }
}

/// A command to run inside an existing container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    /// Keep stdin open.
    pub interactive: bool,
    /// Allocate a pseudo terminal.
    pub tty: bool,
}

impl ExecRequest {
    pub fn new(container: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            container: container.into(),
            command,
            ..Default::default()
        }
    }
}

/// Capabilities the session needs from a container engine.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether [`copy_into`](Self::copy_into) is available.
    fn supports_copy(&self) -> bool;

    /// Whether host paths can be bind-mounted.
    fn supports_mounts(&self) -> bool {
        true
    }

    async fn status(&self, name: &str) -> ContainerResult<ContainerStatus>;

    /// Create and start a container. Returns the engine's container id.
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String>;

    async fn start(&self, name: &str) -> ContainerResult<()>;

    async fn remove(&self, name: &str, force: bool) -> ContainerResult<()>;

    /// Run a short command and report whether it exited successfully.
    async fn exec_status(&self, name: &str, command: &[&str]) -> ContainerResult<bool>;

    /// Copy a host file to `container_path`, replacing it atomically.
    async fn copy_into(
        &self,
        name: &str,
        host_path: &Path,
        container_path: &str,
    ) -> ContainerResult<()>;

    /// Start a command in the container with inherited stdio.
    fn spawn_exec(&self, request: &ExecRequest) -> ContainerResult<Child>;
}

/// Validate a container name.
pub(crate) fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

pub(crate) fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) || image.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Environment variable names: letter or underscore, then alphanumerics.
pub fn validate_env_key(key: &str) -> ContainerResult<()> {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "invalid environment variable key '{}'",
            key
        )));
    }

    Ok(())
}

fn validate_path(path: &str, what: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{what} path cannot be empty"
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{what} path exceeds maximum length of 4096 characters"
        )));
    }

    // ':' would split the engine's -v/--tmpfs syntax.
    if path.contains(['\0', '\n', '\r', ':', ',']) {
        return Err(ContainerError::InvalidInput(format!(
            "{what} path '{}' contains a forbidden character",
            path.escape_debug()
        )));
    }

    Ok(())
}
