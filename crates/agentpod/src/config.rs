//! Configuration loading and resolution.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file at
//! `~/.config/agentpod/config.toml`, then `AGENTPOD__SECTION__KEY`
//! environment variables. [`AppConfig::resolve`] turns the result plus the
//! command line into a [`SessionConfig`]; it is the only place that reads
//! the process environment.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::session::{ForwardMode, ForwardingConfig, SessionConfig, SessionMode};

pub const APP_NAME: &str = "agentpod";

/// Prefix of environment overrides (`AGENTPOD__SSH__MODE=proxy`).
pub const ENV_PREFIX: &str = "AGENTPOD";

/// Host variables passed through to the container when set.
const PASSTHROUGH_ENV: &[&str] = &["TERM", "COLORTERM", "LANG", "LC_ALL"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub image: String,
    /// Host path of an `agentpod-entry` binary to mount into containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_binary: Option<String>,
    pub keepalive: Vec<String>,
    /// Home directory of the agent user inside the container.
    pub container_home: String,
    /// Parent directory for per-session sockets. Defaults to the user's
    /// runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<String>,
    pub session: SessionSection,
    pub ssh: ForwardSection,
    pub gpg: ForwardSection,
    pub secrets: SecretsSection,
    pub extensions: BTreeMap<String, ExtensionConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            image: "ghcr.io/agentpod/agent:latest".to_string(),
            entry_binary: None,
            keepalive: vec!["sleep".to_string(), "infinity".to_string()],
            container_home: "/root".to_string(),
            runtime_dir: None,
            session: SessionSection::default(),
            ssh: ForwardSection::default(),
            gpg: ForwardSection::default(),
            secrets: SecretsSection::default(),
            extensions: builtin_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub mode: SessionMode,
    /// Extensions used when none are given on the command line.
    pub extensions: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mode: SessionMode::Persistent,
            extensions: vec!["claude".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSection {
    pub mode: ForwardMode,
    /// Upstream agent socket. Defaults to the standard location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    /// Key comments, `SHA256:` fingerprints or keygrips; globs allowed.
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSection {
    /// How long to wait for the container entrypoint before giving up.
    pub timeout_secs: u64,
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// An agent CLI that can run in a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub command: Vec<String>,
    /// Host variables treated as secrets for this agent.
    pub secret_env: Vec<String>,
    /// Plain variables set in the container.
    pub env: BTreeMap<String, String>,
}

/// Extensions available without any configuration.
pub fn builtin_extensions() -> BTreeMap<String, ExtensionConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "claude".to_string(),
        ExtensionConfig {
            command: vec!["claude".to_string()],
            secret_env: vec![
                "ANTHROPIC_API_KEY".to_string(),
                "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            ],
            env: BTreeMap::new(),
        },
    );
    map.insert(
        "codex".to_string(),
        ExtensionConfig {
            command: vec!["codex".to_string()],
            secret_env: vec!["OPENAI_API_KEY".to_string()],
            env: BTreeMap::new(),
        },
    );
    map
}

/// Per-invocation choices from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub mode: Option<SessionMode>,
    /// In the order given; the first one provides the command.
    pub extensions: Vec<String>,
    pub args: Vec<String>,
    pub tty: bool,
}

/// `~/.config/agentpod/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("could not determine config directory")?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

/// Load configuration from `path` and the environment.
pub fn load(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("session.mode", "persistent")?
        .set_default("secrets.timeout_secs", 30_i64)?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("reading config {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing config {}", path.display()))?;

    for (name, ext) in builtin_extensions() {
        config.extensions.entry(name).or_insert(ext);
    }
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write the default configuration to `path`.
pub fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn home_path(rel: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(rel))
}

/// `$XDG_RUNTIME_DIR/gnupg/S.gpg-agent` if present, else `~/.gnupg/S.gpg-agent`.
pub fn default_gpg_socket() -> Option<PathBuf> {
    dirs::runtime_dir()
        .map(|dir| dir.join("gnupg").join("S.gpg-agent"))
        .filter(|p| p.exists())
        .or_else(|| home_path(".gnupg/S.gpg-agent"))
}

impl AppConfig {
    pub fn runtime_dir(&self) -> Result<PathBuf> {
        match self.runtime_dir {
            Some(ref dir) => expand_path(dir),
            None => Ok(dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_NAME)),
        }
    }

    /// Resolve one forwarding section. `default_socket` applies when the
    /// section names none.
    pub fn forwarding(
        section: &ForwardSection,
        default_socket: Option<PathBuf>,
        key_dir: Option<PathBuf>,
    ) -> Result<ForwardingConfig> {
        let upstream = match section.socket {
            Some(ref s) => Some(expand_path(s)?),
            None => default_socket,
        };
        Ok(ForwardingConfig {
            mode: section.mode,
            upstream,
            key_dir,
            allow: section.allow.clone(),
        })
    }

    /// Extensions for this run: command-line ones, or the configured default.
    pub fn selected_extensions(&self, overrides: &RunOverrides) -> Result<Vec<String>> {
        let selected = if overrides.extensions.is_empty() {
            self.session.extensions.clone()
        } else {
            overrides.extensions.clone()
        };
        if selected.is_empty() {
            bail!("no extension selected");
        }
        for name in &selected {
            if !self.extensions.contains_key(name) {
                bail!("unknown extension '{name}'");
            }
        }
        Ok(selected)
    }

    /// Build the session configuration for `working_directory`.
    ///
    /// `host_env` is the snapshot of the host environment used for secrets,
    /// passthrough variables and default agent sockets.
    pub fn resolve(
        &self,
        working_directory: &Path,
        overrides: &RunOverrides,
        host_env: HashMap<String, String>,
    ) -> Result<SessionConfig> {
        let extensions = self.selected_extensions(overrides)?;

        let mut command = Vec::new();
        let mut secret_names = Vec::new();
        let mut container_env = HashMap::new();
        for name in &extensions {
            let Some(ext) = self.extensions.get(name) else {
                continue;
            };
            if command.is_empty() {
                command = ext.command.clone();
            }
            for var in &ext.secret_env {
                if !secret_names.contains(var) {
                    secret_names.push(var.clone());
                }
            }
            container_env.extend(ext.env.clone());
        }
        if command.is_empty() {
            bail!("extension '{}' has no command", extensions[0]);
        }
        command.extend(overrides.args.iter().cloned());

        for key in PASSTHROUGH_ENV {
            if let Some(value) = host_env.get(*key) {
                container_env
                    .entry(key.to_string())
                    .or_insert_with(|| value.clone());
            }
        }

        let ssh_socket = host_env.get("SSH_AUTH_SOCK").map(PathBuf::from);
        let entry_binary = self.entry_binary.as_deref().map(expand_path).transpose()?;

        let mut session = SessionConfig::new(working_directory, &self.image);
        session.mode = overrides.mode.unwrap_or(self.session.mode);
        session.extensions = extensions;
        session.keepalive = self.keepalive.clone();
        session.entry_binary = entry_binary;
        session.command = command;
        session.container_env = container_env;
        session.source_env = host_env;
        session.secret_names = secret_names;
        session.secrets_timeout = Duration::from_secs(self.secrets.timeout_secs.max(1));
        session.ssh = Self::forwarding(&self.ssh, ssh_socket, home_path(".ssh"))?;
        session.gpg = Self::forwarding(&self.gpg, default_gpg_socket(), home_path(".gnupg"))?;
        session.container_home = self.container_home.clone();
        session.runtime_dir = self.runtime_dir()?;
        session.tty = overrides.tty;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(exts: &[&str]) -> RunOverrides {
        RunOverrides {
            extensions: exts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.session.mode, SessionMode::Persistent);
        assert_eq!(config.secrets.timeout_secs, 30);
        assert!(config.extensions.contains_key("claude"));
        assert!(config.extensions.contains_key("codex"));
    }

    #[test]
    fn test_load_file_merges_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
backend = "podman"

[ssh]
mode = "proxy"
allow = ["work@laptop"]

[extensions.aider]
command = ["aider"]
secret_env = ["OPENAI_API_KEY"]
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Podman);
        assert_eq!(config.ssh.mode, ForwardMode::Proxy);
        assert_eq!(config.ssh.allow, vec!["work@laptop"]);
        assert_eq!(config.gpg.mode, ForwardMode::Off);
        assert!(config.extensions.contains_key("aider"));
        assert!(config.extensions.contains_key("claude"));
    }

    #[test]
    fn test_write_default_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentpod").join("config.toml");
        write_default(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for agentpod"));
        let config = load(&path).unwrap();
        assert_eq!(config.image, AppConfig::default().image);
    }

    #[test]
    fn test_resolve_collects_secrets_and_command() {
        let config = AppConfig::default();
        let mut env = HashMap::new();
        env.insert("ANTHROPIC_API_KEY".to_string(), "sk-test-1234".to_string());
        env.insert("TERM".to_string(), "xterm".to_string());

        let mut o = overrides(&["codex", "claude"]);
        o.args = vec!["--help".to_string()];
        let session = config.resolve(Path::new("/home/u/project"), &o, env).unwrap();

        assert_eq!(session.command, vec!["codex", "--help"]);
        assert_eq!(
            session.secret_names,
            vec!["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"]
        );
        assert_eq!(session.container_env.get("TERM").map(String::as_str), Some("xterm"));
        assert!(!session.container_env.contains_key("ANTHROPIC_API_KEY"));
        assert_eq!(session.identity().extensions(), ["claude", "codex"]);
    }

    #[test]
    fn test_resolve_rejects_unknown_extension() {
        let config = AppConfig::default();
        let err = config
            .resolve(Path::new("/w"), &overrides(&["nope"]), HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("unknown extension"));
    }

    #[test]
    fn test_resolve_ssh_socket_from_env() {
        let mut config = AppConfig::default();
        config.ssh.mode = ForwardMode::Agent;
        let mut env = HashMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), "/tmp/ssh-x/agent.1".to_string());
        let session = config
            .resolve(Path::new("/w"), &overrides(&["claude"]), env)
            .unwrap();
        assert_eq!(session.ssh.mode, ForwardMode::Agent);
        assert_eq!(session.ssh.upstream, Some(PathBuf::from("/tmp/ssh-x/agent.1")));
    }
}
