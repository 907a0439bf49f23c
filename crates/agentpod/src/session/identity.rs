//! Deterministic container naming.
//!
//! Persistent names are a pure function of the working directory and the
//! extension set, so every invocation for the same project and agents finds
//! the same container. Ephemeral names embed a timestamp and the process id
//! behind their own `ephemeral` segment, so the two shapes never overlap
//! whatever the directory is called.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix shared by every container agentpod creates.
pub const NAME_PREFIX: &str = "agentpod";

const MAX_NORMALIZED_LEN: usize = 20;

/// Whether the container outlives the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Persistent,
    Ephemeral,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Persistent => write!(f, "persistent"),
            SessionMode::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    mode: SessionMode,
    working_directory: PathBuf,
    extensions: Vec<String>,
    name: String,
}

impl SessionIdentity {
    /// Identity for a persistent container.
    pub fn persistent<I, S>(working_directory: impl Into<PathBuf>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let working_directory = working_directory.into();
        let extensions = normalize_extensions(extensions);
        let name = persistent_name(&working_directory, &extensions);
        Self {
            mode: SessionMode::Persistent,
            working_directory,
            extensions,
            name,
        }
    }

    /// Identity for a throwaway container, unique to this process and second.
    pub fn ephemeral<I, S>(working_directory: impl Into<PathBuf>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let working_directory = working_directory.into();
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        let name = ephemeral_name(&working_directory, &stamp, std::process::id());
        Self {
            mode: SessionMode::Ephemeral,
            working_directory,
            extensions: normalize_extensions(extensions),
            name,
        }
    }

    pub fn new<I, S>(mode: SessionMode, working_directory: impl Into<PathBuf>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match mode {
            SessionMode::Persistent => Self::persistent(working_directory, extensions),
            SessionMode::Ephemeral => Self::ephemeral(working_directory, extensions),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Sorted and deduplicated.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn normalize_extensions<I, S>(extensions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut list: Vec<String> = extensions
        .into_iter()
        .map(Into::into)
        .filter(|e| !e.is_empty())
        .collect();
    list.sort();
    list.dedup();
    list
}

/// Lowercase the directory's base name, collapse runs of anything but ASCII
/// letters and digits to `-`, trim `-` at both ends, cap at 20 characters.
pub fn normalize_dir_name(working_directory: &Path) -> String {
    let base = working_directory
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut out = String::with_capacity(base.len());
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }

    let normalized: String = out
        .trim_matches('-')
        .chars()
        .take(MAX_NORMALIZED_LEN)
        .collect();
    if normalized.is_empty() {
        return "workspace".to_string();
    }
    normalized
}

/// `agentpod-persistent-<norm>-<first 8 hex of sha256(wd|exts)>`.
pub fn persistent_name(working_directory: &Path, sorted_extensions: &[String]) -> String {
    let key = format!(
        "{}|{}",
        working_directory.to_string_lossy(),
        sorted_extensions.join(",")
    );
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!(
        "{}-persistent-{}-{}",
        NAME_PREFIX,
        normalize_dir_name(working_directory),
        &digest[..8]
    )
}

/// `agentpod-ephemeral-<norm>-<YYYYmmddHHMMSS>-<pid>`.
pub fn ephemeral_name(working_directory: &Path, timestamp: &str, pid: u32) -> String {
    format!(
        "{}-ephemeral-{}-{}-{}",
        NAME_PREFIX,
        normalize_dir_name(working_directory),
        timestamp,
        pid
    )
}
