//! Daytona sandbox backend.
//!
//! Sandboxes run remotely, so there are no host bind mounts and no file copy
//! primitive. Secrets fall back to the base64 environment transport and
//! agent forwarding is unavailable.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::{Child, Command};

use super::{
    BackendKind, ContainerBackend, ContainerError, ContainerResult, ContainerSpec,
    ContainerStatus, ExecRequest, validate_container_name, validate_env_key,
};

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    #[serde(default, alias = "status")]
    state: String,
}

#[derive(Debug, Clone)]
pub struct DaytonaBackend {
    binary: String,
}

impl Default for DaytonaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DaytonaBackend {
    pub fn new() -> Self {
        Self {
            binary: "daytona".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `daytona create`. Mounts and tmpfs entries are dropped.
    pub fn create_args(&self, spec: &ContainerSpec) -> ContainerResult<Vec<String>> {
        spec.validate()?;

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--image".to_string(),
            spec.image.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        Ok(args)
    }

    /// Arguments for `daytona exec`.
    ///
    /// The CLI has no environment flag, so variables are applied with
    /// `env NAME=VALUE` inside the sandbox. Values are visible to process
    /// inspection there.
    pub fn exec_args(&self, request: &ExecRequest) -> ContainerResult<Vec<String>> {
        validate_container_name(&request.container)?;
        if request.command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let mut args = vec!["exec".to_string(), request.container.clone()];
        if let Some(ref dir) = request.workdir {
            args.push("--cwd".to_string());
            args.push(dir.clone());
        }
        args.push("--".to_string());
        if !request.env.is_empty() {
            args.push("env".to_string());
            for (key, value) in &request.env {
                validate_env_key(key)?;
                args.push(format!("{key}={value}"));
            }
        }
        args.extend(request.command.iter().cloned());
        Ok(args)
    }

    async fn output(&self, name: &str, args: &[&str]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, name);
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::spawn(&self.binary, name, e))
    }

    fn check(&self, name: &str, output: Output) -> ContainerResult<Output> {
        if output.status.success() {
            return Ok(output);
        }
        Err(ContainerError::CommandFailed {
            binary: self.binary.clone(),
            command: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Parse `daytona info --format json` output.
fn parse_info(stdout: &[u8]) -> ContainerResult<ContainerStatus> {
    let info: SandboxInfo =
        serde_json::from_slice(stdout).map_err(|e| ContainerError::ParseError(e.to_string()))?;
    Ok(ContainerStatus::from_state(&info.state))
}

#[async_trait]
impl ContainerBackend for DaytonaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Daytona
    }

    fn supports_copy(&self) -> bool {
        false
    }

    fn supports_mounts(&self) -> bool {
        false
    }

    async fn status(&self, name: &str) -> ContainerResult<ContainerStatus> {
        validate_container_name(name)?;
        let output = self
            .output("info", &["info", name, "--format", "json"])
            .await?;
        if !output.status.success() {
            return Ok(ContainerStatus::Missing);
        }
        parse_info(&output.stdout)
    }

    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        if !spec.mounts.is_empty() || !spec.tmpfs.is_empty() {
            warn!("Daytona sandboxes do not support host mounts; ignoring them");
        }
        let args = self.create_args(spec)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.output("create", &args).await?;
        self.check("create", output)?;
        Ok(spec.name.clone())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        let output = self.output("start", &["start", name]).await?;
        self.check("start", output)?;
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;
        let output = self.output("delete", &["delete", name]).await?;
        self.check("delete", output)?;
        Ok(())
    }

    async fn exec_status(&self, name: &str, command: &[&str]) -> ContainerResult<bool> {
        validate_container_name(name)?;
        let mut args = vec!["exec", name, "--"];
        args.extend_from_slice(command);
        let output = self.output("exec", &args).await?;
        Ok(output.status.success())
    }

    async fn copy_into(
        &self,
        _name: &str,
        _host_path: &Path,
        _container_path: &str,
    ) -> ContainerResult<()> {
        Err(ContainerError::Unsupported {
            backend: BackendKind::Daytona.to_string(),
            what: "file copy".to_string(),
        })
    }

    fn spawn_exec(&self, request: &ExecRequest) -> ContainerResult<Child> {
        let args = self.exec_args(request)?;
        Command::new(&self.binary)
            .args(&args)
            .stdin(if request.interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::spawn(&self.binary, "exec", e))
    }
}
