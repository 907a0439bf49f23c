//! Docker-compatible CLI backend.
//!
//! Covers docker, podman, Rancher Desktop (`nerdctl`) and OrbStack (docker
//! with the `orbstack` context). All of them accept the same `run`, `exec`,
//! `inspect`, `start` and `rm` syntax.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use log::debug;
use tokio::process::{Child, Command};

use super::{
    BackendKind, ContainerBackend, ContainerError, ContainerResult, ContainerSpec,
    ContainerStatus, ExecRequest, Mount, validate_container_name, validate_env_key,
};

/// Shell snippet run by `copy_into`: stream stdin into `$1` through a
/// partial file so readers never see a half-written file.
const COPY_SCRIPT: &str = r#"umask 077 && cat > "$1.partial" && mv -f "$1.partial" "$1""#;

#[derive(Debug, Clone)]
pub struct CliBackend {
    kind: BackendKind,
    binary: String,
    global_args: Vec<String>,
}

impl CliBackend {
    pub fn new(kind: BackendKind) -> Self {
        let (binary, global_args) = match kind {
            BackendKind::Podman => ("podman", vec![]),
            BackendKind::Rancher => ("nerdctl", vec![]),
            BackendKind::Orbstack => (
                "docker",
                vec!["--context".to_string(), "orbstack".to_string()],
            ),
            BackendKind::Docker | BackendKind::Daytona => ("docker", vec![]),
        };
        Self {
            kind,
            binary: binary.to_string(),
            global_args,
        }
    }

    /// Use a custom engine binary path.
    pub fn with_binary(kind: BackendKind, binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::new(kind)
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether volume mounts need SELinux relabeling.
    pub fn needs_selinux_labels(&self) -> bool {
        self.kind == BackendKind::Podman
    }

    fn mount_arg(&self, mount: &Mount) -> String {
        let mut options = Vec::new();
        if mount.read_only {
            options.push("ro");
        }
        if self.needs_selinux_labels() {
            options.push("Z");
        }
        if options.is_empty() {
            format!("{}:{}", mount.host, mount.container)
        } else {
            format!("{}:{}:{}", mount.host, mount.container, options.join(","))
        }
    }

    /// Arguments for creating and starting `spec` in the background.
    pub fn run_args(&self, spec: &ContainerSpec) -> ContainerResult<Vec<String>> {
        spec.validate()?;

        let mut args = self.global_args.clone();
        args.extend(["run", "-d", "--init", "--name"].map(String::from));
        args.push(spec.name.clone());

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(self.mount_arg(mount));
        }

        for tmpfs in &spec.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(format!("{}:mode={:o}", tmpfs.path, tmpfs.mode));
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        if let Some(ref dir) = spec.workdir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        Ok(args)
    }

    /// Arguments for `exec`. Environment values are never placed on the
    /// command line: `-e NAME` makes the engine read them from its own
    /// environment, which [`spawn_exec`](ContainerBackend::spawn_exec) sets.
    pub fn exec_args(&self, request: &ExecRequest) -> ContainerResult<Vec<String>> {
        validate_container_name(&request.container)?;
        if request.command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let mut args = self.global_args.clone();
        args.push("exec".to_string());
        if request.interactive {
            args.push("-i".to_string());
        }
        if request.tty {
            args.push("-t".to_string());
        }
        if let Some(ref dir) = request.workdir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }
        for key in request.env.keys() {
            validate_env_key(key)?;
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(request.container.clone());
        args.extend(request.command.iter().cloned());
        Ok(args)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args);
        cmd
    }

    async fn output(&self, name: &str, args: &[&str]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        self.command()
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

#[async_trait]
impl ContainerBackend for CliBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supports_copy(&self) -> bool {
        true
    }

    async fn status(&self, name: &str) -> ContainerResult<ContainerStatus> {
        validate_container_name(name)?;

        let output = self
            .output("inspect", &["inspect", "--format", "{{.State.Status}}", name])
            .await?;
        if !output.status.success() {
            // Not found is not an error; callers treat it as missing.
            return Ok(ContainerStatus::Missing);
        }

        let state = String::from_utf8_lossy(&output.stdout);
        Ok(ContainerStatus::from_state(state.trim().trim_matches('"')))
    }

    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        let args = self.run_args(spec)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        // global args are re-added by `command()`
        let output = self.output("run", &args[self.global_args.len()..]).await?;
        let output = self.check("run", output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        let output = self.output("start", &["start", name]).await?;
        if !output.status.success() && self.status(name).await? == ContainerStatus::Missing {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        self.check("start", output)?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        let output = self.output("rm", &args).await?;
        self.check("rm", output)?;
        Ok(())
    }

    async fn exec_status(&self, name: &str, command: &[&str]) -> ContainerResult<bool> {
        validate_container_name(name)?;
        let mut args = vec!["exec", name];
        args.extend_from_slice(command);
        let output = self.output("exec", &args).await?;
        Ok(output.status.success())
    }

    async fn copy_into(
        &self,
        name: &str,
        host_path: &Path,
        container_path: &str,
    ) -> ContainerResult<()> {
        validate_container_name(name)?;
        let mut file = tokio::fs::File::open(host_path).await?;

        let mut child = self
            .command()
            .args(["exec", "-i", name, "sh", "-c", COPY_SCRIPT, "agentpod-copy"])
            .arg(container_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::spawn(&self.binary, "exec", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::io::copy(&mut file, &mut stdin).await?;
            // Dropping stdin sends EOF to `cat`.
        }

        let output = child.wait_with_output().await?;
        self.check("exec", output)?;
        Ok(())
    }

    fn spawn_exec(&self, request: &ExecRequest) -> ContainerResult<Child> {
        let args = self.exec_args(request)?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .envs(&request.env)
            .stdin(if request.interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn()
            .map_err(|e| ContainerError::spawn(&self.binary, "exec", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::new("agentpod-ephemeral-app-20240101120000-42", "ubuntu:24.04")
            .workdir("/workspace")
            .mount("/home/u/app", "/workspace")
            .mount_read_only("/home/u/.ssh", "/home/agent/.ssh")
            .tmpfs("/run/agentpod/secrets", 0o1777)
            .env("TERM", "xterm")
            .label("agentpod.session", "agentpod-app")
            .command(vec!["sleep".to_string(), "infinity".to_string()])
    }

    #[test]
    fn test_docker_run_args() {
        let args = CliBackend::new(BackendKind::Docker).run_args(&spec()).unwrap();
        assert_eq!(&args[..5], ["run", "-d", "--init", "--name", "agentpod-ephemeral-app-20240101120000-42"]);
        assert!(args.contains(&"/home/u/app:/workspace".to_string()));
        assert!(args.contains(&"/home/u/.ssh:/home/agent/.ssh:ro".to_string()));
        assert!(args.contains(&"/run/agentpod/secrets:mode=1777".to_string()));
        assert!(args.contains(&"TERM=xterm".to_string()));
        assert_eq!(&args[args.len() - 3..], ["ubuntu:24.04", "sleep", "infinity"]);
    }

    #[test]
    fn test_podman_relabels_volumes() {
        let args = CliBackend::new(BackendKind::Podman).run_args(&spec()).unwrap();
        assert!(args.contains(&"/home/u/app:/workspace:Z".to_string()));
        assert!(args.contains(&"/home/u/.ssh:/home/agent/.ssh:ro,Z".to_string()));
    }

    #[test]
    fn test_orbstack_uses_context() {
        let backend = CliBackend::new(BackendKind::Orbstack);
        assert_eq!(backend.binary(), "docker");
        let args = backend.run_args(&spec()).unwrap();
        assert_eq!(&args[..3], ["--context", "orbstack", "run"]);
        assert_eq!(CliBackend::new(BackendKind::Rancher).binary(), "nerdctl");
    }

    #[test]
    fn test_run_args_validate_input() {
        let bad = ContainerSpec::new("bad name", "ubuntu");
        assert!(CliBackend::new(BackendKind::Docker).run_args(&bad).is_err());
    }

    #[test]
    fn test_exec_args_never_carry_values() {
        let mut request = ExecRequest::new(
            "agentpod-app",
            vec!["agentpod-entry".to_string(), "--".to_string(), "claude".to_string()],
        );
        request.interactive = true;
        request.tty = true;
        request
            .env
            .insert("AGENTPOD_SECRETS_B64".to_string(), "c2VjcmV0".to_string());

        let args = CliBackend::new(BackendKind::Docker).exec_args(&request).unwrap();
        assert_eq!(
            args,
            [
                "exec",
                "-i",
                "-t",
                "-e",
                "AGENTPOD_SECRETS_B64",
                "agentpod-app",
                "agentpod-entry",
                "--",
                "claude"
            ]
        );
        assert!(!args.iter().any(|a| a.contains("c2VjcmV0")));
    }

    #[test]
    fn test_exec_args_reject_empty_command() {
        let request = ExecRequest::new("agentpod-app", vec![]);
        assert!(CliBackend::new(BackendKind::Docker).exec_args(&request).is_err());
    }

    #[tokio::test]
    async fn test_missing_engine_binary() {
        let backend = CliBackend::with_binary(BackendKind::Docker, "/nonexistent/docker");
        let err = backend.status("agentpod-app").await.unwrap_err();
        assert!(matches!(err, ContainerError::EngineNotFound(_)));
    }

    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Third field is the state; zombies are already dead.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_failed_copy_kills_exec_child() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("engine.pid");
        let engine = dir.path().join("engine");
        std::fs::write(
            &engine,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Reading a directory fails after the engine is already running.
        let source = dir.path().join("not-a-file");
        std::fs::create_dir(&source).unwrap();

        let backend = CliBackend::with_binary(BackendKind::Docker, engine.to_string_lossy());
        let err = backend
            .copy_into("agentpod-app", &source, "/run/agentpod/secrets/env-x")
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Io(_)));

        // Give a surviving engine time to record itself.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        loop {
            let pid = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            match pid {
                Some(pid) if process_alive(pid) => {}
                _ => break,
            }
            assert!(std::time::Instant::now() < deadline, "engine still running");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
