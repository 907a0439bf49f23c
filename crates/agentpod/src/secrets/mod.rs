//! Secrets isolation pipeline.
//!
//! Secret-valued environment variables never appear on a container-creation
//! command line. They are filtered out of the visible environment, then
//! delivered after the container exists:
//!
//! - **tmpfs copy**: the entrypoint signals readiness with a marker file in
//!   the secrets tmpfs, the orchestrator copies one serialized file next to
//!   it through the backend, the entrypoint loads and deletes it.
//! - **base64 env** (backends without copy): the serialized bundle rides on
//!   the entrypoint's exec environment as [`SECRETS_B64_ENV`]; the entrypoint
//!   materializes and consumes the same file. The blob is visible to process
//!   inspection, so this is only a fallback.
//!
//! One invocation uses exactly one transport.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info};
use zeroize::Zeroizing;

use crate::backend::{ContainerBackend, validate_env_key};
use crate::error::{PodError, PodResult};
use crate::temp_registry::TempResourceRegistry;

/// Tmpfs mount point inside the container.
pub const SECRETS_DIR: &str = "/run/agentpod/secrets";

/// Mode of the secrets tmpfs; any container user may create files in it.
pub const SECRETS_TMPFS_MODE: u32 = 0o1777;

/// Variable carrying the base64 bundle in fallback mode.
pub const SECRETS_B64_ENV: &str = "AGENTPOD_SECRETS_B64";

/// First line of a serialized bundle.
pub const BUNDLE_HEADER: &str = "# agentpod-secrets v1";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Readiness marker created by the entrypoint.
pub fn ready_marker_path(dir: &str, nonce: &str) -> String {
    format!("{}/.ready-{}", dir.trim_end_matches('/'), nonce)
}

/// File the bundle is delivered to.
pub fn bundle_path(dir: &str, nonce: &str) -> String {
    format!("{}/env-{}", dir.trim_end_matches('/'), nonce)
}

/// How the bundle reaches the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    TmpfsCopy,
    Base64Env,
}

impl Transport {
    /// Pick the transport once from the backend capability.
    pub fn for_backend(supports_copy: bool) -> Self {
        if supports_copy {
            Transport::TmpfsCopy
        } else {
            Transport::Base64Env
        }
    }
}

/// Secret values for one invocation. Zeroed on drop.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct SecretBundle {
    values: BTreeMap<String, Zeroizing<String>>,
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretBundle {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), Zeroizing::new(value.into()));
    }

    /// Serialize as a header line followed by `NAME=<base64(value)>` lines.
    pub fn serialize(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::with_capacity(64 * (self.values.len() + 1)));
        out.push_str(BUNDLE_HEADER);
        out.push('\n');
        for (name, value) in &self.values {
            let encoded = Zeroizing::new(STANDARD.encode(value.as_bytes()));
            out.push_str(name);
            out.push('=');
            out.push_str(&encoded);
            out.push('\n');
        }
        out
    }

    /// Base64 of the serialized bundle, for [`SECRETS_B64_ENV`].
    pub fn encode_for_env(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.serialize().as_bytes()))
    }
}

/// Parse a serialized bundle.
pub fn parse_bundle(text: &str) -> PodResult<SecretBundle> {
    let mut lines = text.lines();
    if lines.next().map(str::trim_end) != Some(BUNDLE_HEADER) {
        return Err(PodError::Delivery(
            "secrets file has an unknown format".to_string(),
        ));
    }

    let mut bundle = SecretBundle::default();
    for (idx, line) in lines.enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let lineno = idx + 2;
        let (name, encoded) = line.split_once('=').ok_or_else(|| {
            PodError::Delivery(format!("secrets file line {lineno} is malformed"))
        })?;
        validate_env_key(name)
            .map_err(|e| PodError::Delivery(format!("secrets file line {lineno}: {e}")))?;
        let raw = Zeroizing::new(STANDARD.decode(encoded).map_err(|_| {
            PodError::Delivery(format!("secrets file line {lineno} has invalid encoding"))
        })?);
        let value = String::from_utf8(raw.to_vec()).map_err(|_| {
            PodError::Delivery(format!("secret {name} is not valid UTF-8"))
        })?;
        bundle.insert(name, value);
    }
    Ok(bundle)
}

/// Decode the value of [`SECRETS_B64_ENV`] back into serialized form.
pub fn decode_env_value(encoded: &str) -> PodResult<Zeroizing<String>> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| PodError::Delivery(format!("{SECRETS_B64_ENV} is not valid base64")))?,
    );
    let text = String::from_utf8(raw.to_vec())
        .map_err(|_| PodError::Delivery(format!("{SECRETS_B64_ENV} is not valid UTF-8")))?;
    Ok(Zeroizing::new(text))
}

/// Remove every secret-bearing key from `env`.
///
/// Must run on every path that turns `env` into container-creation or exec
/// arguments.
pub fn filter_from_env<S: AsRef<str>>(env: &mut HashMap<String, String>, names: &[S]) {
    for name in names {
        if env.remove(name.as_ref()).is_some() {
            debug!("Withholding {} from the container environment", name.as_ref());
        }
    }
}

/// Write a bundle to an owner-only file, replacing any previous one.
pub fn write_bundle_file(path: &Path, serialized: &str) -> PodResult<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read, delete and parse a delivered bundle file.
pub fn consume_bundle_file(path: &Path) -> PodResult<SecretBundle> {
    let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        PodError::Delivery(format!("cannot read {}: {e}", path.display()))
    })?);
    std::fs::remove_file(path)?;
    parse_bundle(&text)
}

/// Delivers a [`SecretBundle`] into one container.
#[derive(Debug, Clone)]
pub struct SecretsPipeline {
    transport: Transport,
    timeout: Duration,
    dir: String,
}

impl SecretsPipeline {
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            dir: SECRETS_DIR.to_string(),
        }
    }

    /// Deliver into `dir` instead of [`SECRETS_DIR`].
    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Collect the listed variables with non-empty values from `source_env`.
    pub fn prepare<S: AsRef<str>>(names: &[S], source_env: &HashMap<String, String>) -> SecretBundle {
        let mut bundle = SecretBundle::default();
        for name in names {
            let name = name.as_ref();
            if let Some(value) = source_env.get(name).filter(|v| !v.is_empty()) {
                bundle.insert(name, value.as_str());
            }
        }
        bundle
    }

    /// Environment to add to the entrypoint's exec for this bundle.
    ///
    /// Only the base64 transport carries anything here.
    pub fn exec_env(&self, bundle: &SecretBundle) -> Option<(&'static str, Zeroizing<String>)> {
        match self.transport {
            Transport::Base64Env if !bundle.is_empty() => {
                Some((SECRETS_B64_ENV, bundle.encode_for_env()))
            }
            _ => None,
        }
    }

    /// Whether the entrypoint must wait for a copied file.
    pub fn entry_waits(&self, bundle: &SecretBundle) -> bool {
        self.transport == Transport::TmpfsCopy && !bundle.is_empty()
    }

    /// Deliver `bundle` into `container` for the entrypoint run with `nonce`.
    ///
    /// With the base64 transport the values travel on the exec itself and
    /// nothing happens here.
    pub async fn deliver(
        &self,
        bundle: &SecretBundle,
        backend: &dyn ContainerBackend,
        container: &str,
        nonce: &str,
    ) -> PodResult<()> {
        if bundle.is_empty() || self.transport == Transport::Base64Env {
            return Ok(());
        }

        self.wait_ready(backend, container, nonce).await?;

        let file = tempfile::Builder::new()
            .prefix("agentpod-secrets-")
            .tempfile()
            .map_err(|e| PodError::Delivery(format!("cannot create intermediate file: {e}")))?;
        let registry = TempResourceRegistry::global();
        registry.register(file.path());

        let result = async {
            write_bundle_file(file.path(), &bundle.serialize())?;
            let target = bundle_path(&self.dir, nonce);
            backend
                .copy_into(container, file.path(), &target)
                .await
                .map_err(|e| PodError::Delivery(e.to_string()))
        }
        .await;

        let path = file.path().to_path_buf();
        if let Err(e) = file.close() {
            debug!("Intermediate secrets file already gone: {}", e);
        }
        registry.unregister(&path);

        result?;
        info!("Delivered {} secret(s) to {}", bundle.len(), container);
        Ok(())
    }

    async fn wait_ready(
        &self,
        backend: &dyn ContainerBackend,
        container: &str,
        nonce: &str,
    ) -> PodResult<()> {
        let marker = ready_marker_path(&self.dir, nonce);
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let ready = backend
                .exec_status(container, &["test", "-e", marker.as_str()])
                .await
                .map_err(|e| PodError::Delivery(e.to_string()))?;
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PodError::Delivery(format!(
                    "container did not become ready within {:?}",
                    self.timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
