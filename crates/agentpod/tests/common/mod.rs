//! Test utilities: stub agents and an in-process container backend.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agentpod::backend::{
    BackendKind, ContainerBackend, ContainerError, ContainerResult, ContainerSpec,
    ContainerStatus, ExecRequest,
};
use agentpod::ssh_agent::protocol::{self, AgentIdentity};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Fake ed25519-shaped key blob; only its bytes matter to the proxy.
pub fn key_blob(seed: u8) -> Vec<u8> {
    let mut blob = Vec::new();
    let name = b"ssh-ed25519";
    blob.extend_from_slice(&(name.len() as u32).to_be_bytes());
    blob.extend_from_slice(name);
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(&[seed; 32]);
    blob
}

/// Message type that makes [`StubSshAgent`] hang up on the sender without
/// replying.
pub const STUB_HANG_UP: u8 = 0xf0;

/// An SSH agent on a Unix socket that records every request it receives.
pub struct StubSshAgent {
    pub path: PathBuf,
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl StubSshAgent {
    pub fn spawn(identities: Vec<AgentIdentity>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upstream.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        let identities = Arc::new(identities);
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = Arc::clone(&recorded);
                let identities = Arc::clone(&identities);
                tokio::spawn(async move {
                    while let Ok(Some(frame)) = protocol::read_frame(&mut stream).await {
                        recorded.lock().unwrap().push(frame.clone());
                        let reply = match frame.first().copied() {
                            Some(STUB_HANG_UP) => return,
                            Some(protocol::SSH_AGENTC_REQUEST_IDENTITIES) => {
                                protocol::encode_identities_answer(&identities)
                            }
                            Some(protocol::SSH_AGENTC_SIGN_REQUEST) => {
                                let mut reply = vec![protocol::SSH_AGENT_SIGN_RESPONSE];
                                reply.extend_from_slice(&4u32.to_be_bytes());
                                reply.extend_from_slice(b"sig!");
                                reply
                            }
                            _ => vec![protocol::SSH_AGENT_SUCCESS],
                        };
                        if protocol::write_frame(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            path,
            requests,
            task,
            _dir: dir,
        }
    }

    /// Message types received so far.
    pub fn request_types(&self) -> Vec<u8> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.first().copied())
            .collect()
    }
}

impl Drop for StubSshAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A gpg-agent speaking just enough Assuan for the proxy tests.
///
/// `KEYINFO --list` reports every configured grip; other commands get `OK`.
pub struct StubGpgAgent {
    pub path: PathBuf,
    pub lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl StubGpgAgent {
    pub fn spawn(grips: Vec<String>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.gpg-agent");
        let listener = UnixListener::bind(&path).unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&lines);
        let grips = Arc::new(grips);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = Arc::clone(&recorded);
                let grips = Arc::clone(&grips);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    if write.write_all(b"OK Pleased to meet you\n").await.is_err() {
                        return;
                    }
                    let mut reader = BufReader::new(read).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        recorded.lock().unwrap().push(line.clone());
                        let mut reply = String::new();
                        if line.starts_with("KEYINFO --list") {
                            for grip in grips.iter() {
                                reply.push_str(&format!("S KEYINFO {grip} D - - - P - - -\n"));
                            }
                        }
                        reply.push_str("OK\n");
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                        if line == "BYE" {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            path,
            lines,
            task,
            _dir: dir,
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Drop for StubGpgAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Backend that keeps containers in memory and treats the local filesystem
/// as the inside of every container.
pub struct FakeBackend {
    pub copy: bool,
    pub mounts: bool,
    pub containers: Mutex<HashMap<String, ContainerStatus>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// Host mount sources per container; `start` fails if one is missing,
    /// as the real engines do.
    pub mount_sources: Mutex<HashMap<String, Vec<PathBuf>>>,
    /// Runs this instead of the requested exec command.
    pub exec_override: Option<Vec<String>>,
}

impl FakeBackend {
    /// Docker-like: copy and mounts supported.
    pub fn new() -> Self {
        Self::with_capabilities(true, true)
    }

    /// Daytona-like: neither copy nor mounts.
    pub fn remote() -> Self {
        Self::with_capabilities(false, false)
    }

    pub fn with_capabilities(copy: bool, mounts: bool) -> Self {
        Self {
            copy,
            mounts,
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            mount_sources: Mutex::new(HashMap::new()),
            exec_override: None,
        }
    }

    pub fn with_exec_override(mut self, command: &[&str]) -> Self {
        self.exec_override = Some(command.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn insert(&self, name: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    pub fn insert_with_mounts(&self, name: &str, status: ContainerStatus, sources: Vec<PathBuf>) {
        self.insert(name, status);
        self.mount_sources
            .lock()
            .unwrap()
            .insert(name.to_string(), sources);
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        if self.mounts {
            BackendKind::Docker
        } else {
            BackendKind::Daytona
        }
    }

    fn supports_copy(&self) -> bool {
        self.copy
    }

    fn supports_mounts(&self) -> bool {
        self.mounts
    }

    async fn status(&self, name: &str) -> ContainerResult<ContainerStatus> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(ContainerStatus::Missing))
    }

    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;
        self.created.lock().unwrap().push(spec.clone());
        let sources = spec.mounts.iter().map(|m| PathBuf::from(&m.host)).collect();
        self.insert_with_mounts(&spec.name, ContainerStatus::Running, sources);
        Ok(format!("{}-0123456789abcdef", spec.name))
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        let sources = self
            .mount_sources
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        if let Some(missing) = sources.iter().find(|p| !p.exists()) {
            return Err(ContainerError::CommandFailed {
                binary: "fake".to_string(),
                command: "start".to_string(),
                message: format!("mount source {} does not exist", missing.display()),
            });
        }

        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(status) => {
                *status = ContainerStatus::Running;
                self.started.lock().unwrap().push(name.to_string());
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> ContainerResult<()> {
        self.containers.lock().unwrap().remove(name);
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn exec_status(&self, _name: &str, command: &[&str]) -> ContainerResult<bool> {
        match command {
            ["test", "-e", path] => Ok(Path::new(path).exists()),
            other => Err(ContainerError::InvalidInput(format!(
                "unexpected command {other:?}"
            ))),
        }
    }

    async fn copy_into(
        &self,
        name: &str,
        host_path: &Path,
        container_path: &str,
    ) -> ContainerResult<()> {
        if !self.copy {
            return Err(ContainerError::Unsupported {
                backend: "fake".to_string(),
                what: "copy".to_string(),
            });
        }
        if !self.containers.lock().unwrap().contains_key(name) {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        let partial = format!("{container_path}.partial");
        tokio::fs::copy(host_path, &partial).await?;
        tokio::fs::rename(&partial, container_path).await?;
        Ok(())
    }

    fn spawn_exec(&self, request: &ExecRequest) -> ContainerResult<Child> {
        let command = self.exec_override.as_ref().unwrap_or(&request.command);
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ContainerError::InvalidInput("empty command".to_string()))?;
        let child = tokio::process::Command::new(program)
            .args(args)
            .envs(&request.env)
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}
