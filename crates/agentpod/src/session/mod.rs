//! Container session orchestration.
//!
//! A [`ContainerSession`] owns everything one invocation creates: the agent
//! proxies, the secrets delivery and (for ephemeral sessions) the container
//! itself.
//!
//! ```text
//! Uninitialized -> Creating | Attaching -> Running -> TearingDown -> Done
//! ```
//!
//! Proxy sockets live in per-invocation directories below a per-session
//! runtime directory. That runtime directory is bind-mounted into the
//! container once, at creation, so later invocations attaching to the same
//! persistent container can hand it fresh sockets through the exec
//! environment.

pub mod identity;

pub use identity::{SessionIdentity, SessionMode};

use std::collections::{BTreeMap, HashMap};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::allowlist::AllowList;
use crate::backend::{ContainerBackend, ContainerSpec, ContainerStatus, ExecRequest, Mount};
use crate::error::{PodError, PodResult};
use crate::gpg_agent::GpgAgentProxy;
use crate::secrets::{
    self, SECRETS_DIR, SECRETS_TMPFS_MODE, SecretBundle, SecretsPipeline, Transport,
};
use crate::ssh_agent::SshAgentProxy;
use crate::temp_registry::TempResourceRegistry;

/// Where the runtime directory appears inside the container.
pub const FORWARD_DIR: &str = "/run/agentpod/forward";

/// Where a host-provided entry binary is mounted.
pub const ENTRY_MOUNT_PATH: &str = "/run/agentpod/bin/agentpod-entry";

/// Entry binary name when the image ships it.
pub const ENTRY_BINARY: &str = "agentpod-entry";

/// Project mount point and working directory inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Exec variable pointing the entrypoint at the GPG proxy socket.
pub const GPG_SOCK_ENV: &str = "AGENTPOD_GPG_AGENT_SOCK";

/// How host credentials reach the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    #[serde(alias = "false")]
    Off,
    /// Mount the key directory read-only.
    Keys,
    /// Proxy the agent without filtering.
    #[serde(alias = "true")]
    Agent,
    /// Proxy the agent through the allow-list.
    Proxy,
}

impl std::fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardMode::Off => "off",
            ForwardMode::Keys => "keys",
            ForwardMode::Agent => "agent",
            ForwardMode::Proxy => "proxy",
        };
        f.write_str(s)
    }
}

/// Forwarding settings for one agent kind.
#[derive(Debug, Clone, Default)]
pub struct ForwardingConfig {
    pub mode: ForwardMode,
    /// Host agent socket, for `agent` and `proxy`.
    pub upstream: Option<PathBuf>,
    /// Host key directory, for `keys`.
    pub key_dir: Option<PathBuf>,
    /// Allow-list rules, for `proxy`.
    pub allow: Vec<String>,
}

/// Fully resolved settings for one invocation.
///
/// Built once by the configuration layer; nothing below reads the process
/// environment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub working_directory: PathBuf,
    pub extensions: Vec<String>,
    pub image: String,
    /// Long-running command that keeps the container alive.
    pub keepalive: Vec<String>,
    /// Host path of an entry binary to mount, if the image lacks one.
    pub entry_binary: Option<PathBuf>,
    /// Agent command and its arguments.
    pub command: Vec<String>,
    /// Environment for the container. Secrets are filtered out before use.
    pub container_env: HashMap<String, String>,
    /// Snapshot of the host environment secrets are taken from.
    pub source_env: HashMap<String, String>,
    pub secret_names: Vec<String>,
    pub secrets_timeout: Duration,
    pub ssh: ForwardingConfig,
    pub gpg: ForwardingConfig,
    /// Home directory inside the container, for `keys` mounts.
    pub container_home: String,
    /// Parent of the per-session runtime directories.
    pub runtime_dir: PathBuf,
    pub tty: bool,
}

impl SessionConfig {
    pub fn new(working_directory: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            mode: SessionMode::Persistent,
            working_directory: working_directory.into(),
            extensions: Vec::new(),
            image: image.into(),
            keepalive: vec!["sleep".to_string(), "infinity".to_string()],
            entry_binary: None,
            command: Vec::new(),
            container_env: HashMap::new(),
            source_env: HashMap::new(),
            secret_names: Vec::new(),
            secrets_timeout: Duration::from_secs(30),
            ssh: ForwardingConfig::default(),
            gpg: ForwardingConfig::default(),
            container_home: "/root".to_string(),
            runtime_dir: std::env::temp_dir().join("agentpod"),
            tty: false,
        }
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(self.mode, &self.working_directory, self.extensions.iter().cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Creating,
    Attaching,
    Running,
    TearingDown,
    Done,
}

/// What forwarding contributes to the container and the exec.
#[derive(Debug, Clone, Default)]
pub struct ForwardingPlan {
    /// Mounts needed at container creation.
    pub mounts: Vec<Mount>,
    /// Variables for the agent exec.
    pub exec_env: BTreeMap<String, String>,
    /// One line per disabled forwarding, for the user.
    pub warnings: Vec<String>,
}

/// Translate a host path under `base` to its place under [`FORWARD_DIR`].
fn container_path(base: &Path, host: &Path) -> Option<String> {
    let rel = host.strip_prefix(base).ok()?;
    Some(format!("{}/{}", FORWARD_DIR, rel.to_string_lossy()))
}

/// Per-session runtime directory: short so socket paths stay under the
/// `sun_path` limit.
pub fn runtime_base_dir(runtime_dir: &Path, session_name: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(session_name.as_bytes()));
    runtime_dir.join(&digest[..12])
}

pub struct ContainerSession {
    config: SessionConfig,
    identity: SessionIdentity,
    backend: Arc<dyn ContainerBackend>,
    state: SessionState,
    runtime_base: PathBuf,
    ssh: Option<SshAgentProxy>,
    gpg: Option<GpgAgentProxy>,
    created: bool,
}

impl ContainerSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn ContainerBackend>) -> Self {
        let identity = config.identity();
        let runtime_base = runtime_base_dir(&config.runtime_dir, identity.name());
        Self {
            config,
            identity,
            backend,
            state: SessionState::Uninitialized,
            runtime_base,
            ssh: None,
            gpg: None,
            created: false,
        }
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn runtime_base(&self) -> &Path {
        &self.runtime_base
    }

    /// Whether this invocation created the container.
    pub fn created_container(&self) -> bool {
        self.created
    }

    pub fn transport(&self) -> Transport {
        Transport::for_backend(self.backend.supports_copy())
    }

    /// Choose between creating and attaching.
    pub async fn decide(&mut self) -> PodResult<SessionState> {
        if self.state != SessionState::Uninitialized {
            return Ok(self.state);
        }

        self.state = match self.identity.mode() {
            SessionMode::Ephemeral => SessionState::Creating,
            SessionMode::Persistent => match self.backend.status(self.name()).await? {
                ContainerStatus::Missing => SessionState::Creating,
                ContainerStatus::Running | ContainerStatus::Stopped => SessionState::Attaching,
            },
        };
        debug!("Session {} is {:?}", self.name(), self.state);
        Ok(self.state)
    }

    fn ensure_runtime_base(&self) -> PodResult<()> {
        std::fs::create_dir_all(&self.runtime_base).map_err(|source| PodError::Bind {
            path: self.runtime_base.clone(),
            source,
        })?;
        std::fs::set_permissions(&self.runtime_base, Permissions::from_mode(0o700)).map_err(
            |source| PodError::Bind {
                path: self.runtime_base.clone(),
                source,
            },
        )?;
        // A persistent container keeps this directory mounted; only
        // ephemeral sessions may delete it.
        if self.identity.mode() == SessionMode::Ephemeral {
            TempResourceRegistry::global().register(&self.runtime_base);
        }
        Ok(())
    }

    /// Start the proxies and work out mounts and exec variables.
    ///
    /// Degradable problems with one kind of forwarding only disable that
    /// kind; they end up in [`ForwardingPlan::warnings`].
    pub fn start_forwarding(&mut self) -> PodResult<ForwardingPlan> {
        let mut plan = ForwardingPlan::default();

        if !self.backend.supports_mounts() {
            for (label, fwd) in [("SSH", &self.config.ssh), ("GPG", &self.config.gpg)] {
                if fwd.mode != ForwardMode::Off {
                    plan.warnings.push(format!(
                        "{label} forwarding disabled: {} backend cannot mount host paths",
                        self.backend.kind()
                    ));
                }
            }
            return Ok(plan);
        }

        let needs_proxy = [&self.config.ssh, &self.config.gpg]
            .iter()
            .any(|f| matches!(f.mode, ForwardMode::Agent | ForwardMode::Proxy));
        if needs_proxy && let Err(e) = self.ensure_runtime_base() {
            if !e.is_degradable() {
                return Err(e);
            }
            plan.warnings
                .push(format!("agent forwarding disabled: {e}"));
            return Ok(plan);
        }

        let home = self.config.container_home.trim_end_matches('/').to_string();

        match self.start_ssh() {
            Ok(Some(socket)) => {
                plan.exec_env.insert("SSH_AUTH_SOCK".to_string(), socket);
            }
            Ok(None) => {}
            Err(e) if e.is_degradable() => {
                plan.warnings.push(format!("SSH forwarding disabled: {e}"));
            }
            Err(e) => return Err(e),
        }
        if self.config.ssh.mode == ForwardMode::Keys {
            match self.config.ssh.key_dir {
                Some(ref dir) if dir.is_dir() => plan.mounts.push(Mount {
                    host: dir.to_string_lossy().into_owned(),
                    container: format!("{home}/.ssh"),
                    read_only: true,
                }),
                _ => plan
                    .warnings
                    .push("SSH key mount disabled: no key directory".to_string()),
            }
        }

        match self.start_gpg() {
            Ok(Some(socket)) => {
                plan.exec_env.insert(GPG_SOCK_ENV.to_string(), socket);
            }
            Ok(None) => {}
            Err(e) if e.is_degradable() => {
                plan.warnings.push(format!("GPG forwarding disabled: {e}"));
            }
            Err(e) => return Err(e),
        }
        if self.config.gpg.mode == ForwardMode::Keys {
            match self.config.gpg.key_dir {
                Some(ref dir) if dir.is_dir() => plan.mounts.push(Mount {
                    host: dir.to_string_lossy().into_owned(),
                    container: format!("{home}/.gnupg"),
                    read_only: true,
                }),
                _ => plan
                    .warnings
                    .push("GPG key mount disabled: no key directory".to_string()),
            }
        }

        for warning in &plan.warnings {
            warn!("{}", warning);
        }
        Ok(plan)
    }

    fn start_ssh(&mut self) -> PodResult<Option<String>> {
        let fwd = &self.config.ssh;
        let allow = match fwd.mode {
            ForwardMode::Agent => AllowList::passthrough(),
            ForwardMode::Proxy => AllowList::new(&fwd.allow)?,
            ForwardMode::Off | ForwardMode::Keys => return Ok(None),
        };
        let upstream = fwd
            .upstream
            .clone()
            .ok_or_else(|| PodError::Config("no SSH agent socket (SSH_AUTH_SOCK unset)".into()))?;

        let proxy = SshAgentProxy::new(upstream, allow)?.with_base_dir(&self.runtime_base);
        let socket = proxy.start()?;
        let in_container = container_path(&self.runtime_base, &socket)
            .ok_or_else(|| PodError::Config("SSH socket outside the runtime directory".into()))?;
        self.ssh = Some(proxy);
        Ok(Some(in_container))
    }

    fn start_gpg(&mut self) -> PodResult<Option<String>> {
        let fwd = &self.config.gpg;
        let allow = match fwd.mode {
            ForwardMode::Agent => AllowList::passthrough(),
            ForwardMode::Proxy => AllowList::new(&fwd.allow)?,
            ForwardMode::Off | ForwardMode::Keys => return Ok(None),
        };
        let upstream = fwd
            .upstream
            .clone()
            .ok_or_else(|| PodError::Config("no GPG agent socket found".into()))?;

        let proxy = GpgAgentProxy::new(upstream, allow)?.with_base_dir(&self.runtime_base);
        let socket = proxy.start()?;
        let in_container = container_path(&self.runtime_base, &socket)
            .ok_or_else(|| PodError::Config("GPG socket outside the runtime directory".into()))?;
        self.gpg = Some(proxy);
        Ok(Some(in_container))
    }

    /// Environment for container creation, with every secret removed.
    pub fn visible_env(&self) -> HashMap<String, String> {
        let mut env = self.config.container_env.clone();
        secrets::filter_from_env(&mut env, &self.config.secret_names);
        env
    }

    /// Creation spec for this session's container.
    pub fn container_spec(&self, plan: &ForwardingPlan) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.name(), &self.config.image)
            .workdir(WORKSPACE_DIR)
            .label("agentpod.session", self.name())
            .label("agentpod.mode", self.identity.mode().to_string())
            .command(self.config.keepalive.clone());

        if self.backend.supports_mounts() {
            spec = spec.mount(
                self.config.working_directory.to_string_lossy(),
                WORKSPACE_DIR,
            );
            spec.mounts.extend(plan.mounts.iter().cloned());
            spec = spec.mount_read_only(self.runtime_base.to_string_lossy(), FORWARD_DIR);
            if let Some(ref entry) = self.config.entry_binary {
                spec = spec.mount_read_only(entry.to_string_lossy(), ENTRY_MOUNT_PATH);
            }
        }

        if self.transport() == Transport::TmpfsCopy {
            spec = spec.tmpfs(SECRETS_DIR, SECRETS_TMPFS_MODE);
        }

        spec.env.extend(self.visible_env());
        spec
    }

    /// Create the container or bring the existing one up.
    pub async fn ensure_container(&mut self, plan: &ForwardingPlan) -> PodResult<()> {
        match self.decide().await? {
            SessionState::Creating => {
                if self.backend.supports_mounts() {
                    // Must exist before the engine mounts it.
                    self.ensure_runtime_base()?;
                }
                let spec = self.container_spec(plan);
                let id = self.backend.create(&spec).await?;
                self.created = true;
                info!("Created container {} ({})", self.name(), short_id(&id));
            }
            SessionState::Attaching => {
                if self.backend.supports_mounts() {
                    // The mount source may be gone after a logout or reboot.
                    self.ensure_runtime_base()?;
                }
                if self.backend.status(self.name()).await? != ContainerStatus::Running {
                    info!("Starting stopped container {}", self.name());
                    self.backend.start(self.name()).await?;
                } else {
                    info!("Attaching to running container {}", self.name());
                }
                if !plan.mounts.is_empty() {
                    debug!("Key mounts only apply when the container is created");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn entry_path(&self) -> String {
        if self.config.entry_binary.is_some() && self.backend.supports_mounts() {
            ENTRY_MOUNT_PATH.to_string()
        } else {
            ENTRY_BINARY.to_string()
        }
    }

    /// Exec of the entrypoint wrapping the agent command.
    pub fn exec_request(
        &self,
        plan: &ForwardingPlan,
        pipeline: &SecretsPipeline,
        bundle: &SecretBundle,
        nonce: &str,
    ) -> ExecRequest {
        let mut command = vec![self.entry_path(), "--nonce".to_string(), nonce.to_string()];
        if pipeline.entry_waits(bundle) {
            command.push("--wait-secrets".to_string());
            command.push("--timeout".to_string());
            command.push(self.config.secrets_timeout.as_secs().max(1).to_string());
        }
        command.push("--secrets-dir".to_string());
        command.push(pipeline.dir().to_string());
        command.push("--".to_string());
        command.extend(self.config.command.iter().cloned());

        let mut request = ExecRequest::new(self.name(), command);
        request.workdir = Some(WORKSPACE_DIR.to_string());
        request.interactive = true;
        request.tty = self.config.tty;
        request.env = plan.exec_env.clone();
        if let Some((key, value)) = pipeline.exec_env(bundle) {
            request.env.insert(key.to_string(), value.to_string());
        }
        request
    }

    /// Run the agent to completion and return its exit code.
    ///
    /// The caller must run [`teardown`](Self::teardown) afterwards, whatever
    /// the outcome.
    pub async fn run(&mut self) -> PodResult<i32> {
        if self.config.command.is_empty() {
            return Err(PodError::Config("no agent command configured".to_string()));
        }

        self.decide().await?;
        let plan = self.start_forwarding()?;

        let bundle = SecretsPipeline::prepare(&self.config.secret_names, &self.config.source_env);
        let pipeline = SecretsPipeline::new(self.transport(), self.config.secrets_timeout);
        if !bundle.is_empty() {
            debug!("Secrets {:?} via {:?}", bundle, pipeline.transport());
        }

        self.ensure_container(&plan).await?;

        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let request = self.exec_request(&plan, &pipeline, &bundle, &nonce);
        let mut child = self.backend.spawn_exec(&request)?;
        drop(request);
        self.state = SessionState::Running;

        let status = tokio::select! {
            delivered = pipeline.deliver(&bundle, self.backend.as_ref(), self.name(), &nonce) => {
                if let Err(e) = delivered {
                    if let Err(kill_err) = child.kill().await {
                        debug!("Agent exec already gone: {}", kill_err);
                    }
                    self.discard_created_container().await;
                    return Err(e);
                }
                // Delivered; zero the values now rather than at agent exit.
                drop(bundle);
                child.wait().await?
            }
            status = child.wait() => status?,
        };

        Ok(status.code().unwrap_or(1))
    }

    async fn discard_created_container(&mut self) {
        if !self.created {
            return;
        }
        warn!("Removing container {} after failed setup", self.name());
        if let Err(e) = self.backend.remove(self.name(), true).await {
            warn!("Failed to remove container {}: {}", self.name(), e);
        }
        self.created = false;
    }

    /// Stop proxies, remove ephemeral containers and purge temp paths.
    ///
    /// Every step runs regardless of the others; failures are only logged.
    pub async fn teardown(&mut self) {
        if self.state == SessionState::Done {
            return;
        }
        self.state = SessionState::TearingDown;

        if let Some(proxy) = self.ssh.take() {
            proxy.stop().await;
        }
        if let Some(proxy) = self.gpg.take() {
            proxy.stop().await;
        }

        if self.identity.mode() == SessionMode::Ephemeral {
            match self.backend.status(self.name()).await {
                Ok(ContainerStatus::Missing) => {}
                Ok(_) => {
                    if let Err(e) = self.backend.remove(self.name(), true).await {
                        warn!("Failed to remove container {}: {}", self.name(), e);
                    }
                }
                Err(e) => warn!("Could not inspect container {}: {}", self.name(), e),
            }
        }

        let purged = TempResourceRegistry::global().purge();
        debug!("Teardown removed {} temp path(s)", purged);
        self.state = SessionState::Done;
    }

    /// Socket of the running SSH proxy, on the host.
    pub fn ssh_socket(&self) -> Option<PathBuf> {
        self.ssh.as_ref().and_then(SshAgentProxy::socket_path)
    }

    /// Socket of the running GPG proxy, on the host.
    pub fn gpg_socket(&self) -> Option<PathBuf> {
        self.gpg.as_ref().and_then(GpgAgentProxy::socket_path)
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_mode_aliases() {
        #[derive(Deserialize)]
        struct W {
            mode: ForwardMode,
        }
        let parse = |s: &str| toml::from_str::<W>(&format!("mode = \"{s}\"")).unwrap().mode;
        assert_eq!(parse("true"), ForwardMode::Agent);
        assert_eq!(parse("agent"), ForwardMode::Agent);
        assert_eq!(parse("proxy"), ForwardMode::Proxy);
        assert_eq!(parse("keys"), ForwardMode::Keys);
        assert_eq!(parse("off"), ForwardMode::Off);
    }

    #[test]
    fn test_runtime_base_dir() {
        let a = runtime_base_dir(Path::new("/run/user/1000/agentpod"), "agentpod-x");
        let b = runtime_base_dir(Path::new("/run/user/1000/agentpod"), "agentpod-x");
        let c = runtime_base_dir(Path::new("/run/user/1000/agentpod"), "agentpod-y");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.file_name().unwrap().len(), 12);
    }

    #[test]
    fn test_container_path() {
        let base = Path::new("/run/user/1000/agentpod/abc");
        assert_eq!(
            container_path(base, &base.join("ssh-x1/agent.sock")).as_deref(),
            Some("/run/agentpod/forward/ssh-x1/agent.sock")
        );
        assert!(container_path(base, Path::new("/tmp/other")).is_none());
    }
}
