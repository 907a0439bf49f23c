//! agentpod-entry - in-container wrapper that loads secrets and execs the agent.
//!
//! Runs as the command of every `exec` agentpod makes into a container:
//!
//! 1. Links `~/.gnupg/S.gpg-agent` to the forwarded GPG socket, if any
//! 2. Loads secrets, either from `AGENTPOD_SECRETS_B64` or by announcing
//!    readiness and waiting for the host to copy the secrets file in
//! 3. Deletes the secrets file and replaces itself with the agent command
//!
//! ```bash
//! agentpod-entry --nonce 3f2a... --wait-secrets --timeout 30 -- claude
//! ```

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, warn};

use agentpod::secrets::{self, SECRETS_B64_ENV, SECRETS_DIR, SecretBundle};
use agentpod::session::GPG_SOCK_ENV;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(
    name = "agentpod-entry",
    about = "Load delivered secrets and exec the agent command"
)]
struct Args {
    /// Per-invocation token naming the marker and secrets files
    #[arg(long)]
    nonce: String,

    /// Wait for the host to copy a secrets file
    #[arg(long)]
    wait_secrets: bool,

    /// Seconds to wait for the secrets file
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Directory the secrets file is delivered to
    #[arg(long, default_value = SECRETS_DIR)]
    secrets_dir: String,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn validate_nonce(nonce: &str) -> Result<()> {
    if nonce.is_empty() || !nonce.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        bail!("invalid nonce '{nonce}'");
    }
    Ok(())
}

/// Point gpg at the forwarded agent socket.
fn link_gpg_socket(target: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, symlink};

    let home = dirs::home_dir().context("no home directory")?;
    let gnupg = home.join(".gnupg");
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&gnupg)
        .with_context(|| format!("creating {}", gnupg.display()))?;

    let link = gnupg.join("S.gpg-agent");
    match std::fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("replacing {}", link.display())),
    }
    symlink(target, &link).with_context(|| format!("linking {}", link.display()))?;
    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}

fn ensure_secrets_dir(dir: &str) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("creating {dir}"))
}

/// Base64 transport: materialize the file, then consume it like a copy.
fn load_from_env(encoded: &str, dir: &str, nonce: &str) -> Result<SecretBundle> {
    let serialized = secrets::decode_env_value(encoded)?;
    ensure_secrets_dir(dir)?;
    let path = PathBuf::from(secrets::bundle_path(dir, nonce));
    secrets::write_bundle_file(&path, &serialized)?;
    Ok(secrets::consume_bundle_file(&path)?)
}

/// Copy transport: announce readiness and wait for the file.
fn wait_for_copy(dir: &str, nonce: &str, timeout: Duration) -> Result<SecretBundle> {
    let marker = PathBuf::from(secrets::ready_marker_path(dir, nonce));
    let path = PathBuf::from(secrets::bundle_path(dir, nonce));

    ensure_secrets_dir(dir)?;
    std::fs::write(&marker, b"").with_context(|| format!("creating {}", marker.display()))?;

    let deadline = Instant::now() + timeout;
    let result = loop {
        if path.exists() {
            break secrets::consume_bundle_file(&path).map_err(anyhow::Error::from);
        }
        if Instant::now() >= deadline {
            break Err(anyhow::anyhow!(
                "no secrets delivered within {}s",
                timeout.as_secs()
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if let Err(e) = std::fs::remove_file(&marker) {
        warn!("Could not remove {}: {}", marker.display(), e);
    }
    result
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    validate_nonce(&args.nonce)?;

    if let Some(target) = std::env::var_os(GPG_SOCK_ENV)
        && let Err(e) = link_gpg_socket(Path::new(&target))
    {
        warn!("GPG forwarding unavailable: {:#}", e);
    }

    let bundle = match std::env::var(SECRETS_B64_ENV) {
        Ok(encoded) => load_from_env(&encoded, &args.secrets_dir, &args.nonce)
            .context("loading secrets from the environment")?,
        Err(_) if args.wait_secrets => wait_for_copy(
            &args.secrets_dir,
            &args.nonce,
            Duration::from_secs(args.timeout),
        )
        .context("waiting for secrets")?,
        Err(_) => SecretBundle::default(),
    };
    debug!("Loaded {:?}", bundle);

    let (program, rest) = args
        .command
        .split_first()
        .context("no command given")?;
    let mut cmd = Command::new(program);
    cmd.args(rest).env_remove(SECRETS_B64_ENV).env_remove(GPG_SOCK_ENV);
    for (name, value) in bundle.iter() {
        cmd.env(name, value);
    }

    // Only returns on failure.
    let err = cmd.exec();
    Err(err).with_context(|| format!("executing {program}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_nonce() {
        assert!(validate_nonce("3f2a9c").is_ok());
        assert!(validate_nonce("").is_err());
        assert!(validate_nonce("../etc").is_err());
    }

    #[test]
    fn test_load_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let secrets_dir = dir.path().join("secrets");
        let mut bundle = SecretBundle::default();
        bundle.insert("OPENAI_API_KEY", "sk-openai");

        let loaded = load_from_env(
            &bundle.encode_for_env(),
            secrets_dir.to_str().unwrap(),
            "n1",
        )
        .unwrap();
        assert_eq!(loaded, bundle);
        assert!(!secrets_dir.join("env-n1").exists());
    }

    #[test]
    fn test_wait_for_copy_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let err = wait_for_copy(&dir, "n2", Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("no secrets delivered"));
        assert!(!Path::new(&secrets::ready_marker_path(&dir, "n2")).exists());
    }

    #[test]
    fn test_wait_for_copy_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap().to_string();
        let mut bundle = SecretBundle::default();
        bundle.insert("ANTHROPIC_API_KEY", "sk-test-1234");

        let writer_dir = dir_str.clone();
        let expected = bundle.clone();
        let writer = std::thread::spawn(move || {
            let marker = PathBuf::from(secrets::ready_marker_path(&writer_dir, "n3"));
            while !marker.exists() {
                std::thread::sleep(Duration::from_millis(10));
            }
            let path = PathBuf::from(secrets::bundle_path(&writer_dir, "n3"));
            secrets::write_bundle_file(&path, &expected.serialize()).unwrap();
        });

        let loaded = wait_for_copy(&dir_str, "n3", Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert_eq!(loaded, bundle);
        assert_eq!(loaded.get("ANTHROPIC_API_KEY"), Some("sk-test-1234"));
    }
}
