//! Filtering SSH agent proxy.
//!
//! Sits between the container and the host's real SSH agent and only exposes
//! allow-listed identities.
//!
//! ## How it works
//!
//! 1. A client inside the container connects to the proxy socket
//! 2. The proxy opens a companion connection to the upstream agent
//! 3. Identity listings are forwarded and rewritten to allow-listed keys
//! 4. Sign requests are checked before forwarding; denied keys get a local
//!    `SSH_AGENT_FAILURE` and never reach the upstream agent
//! 5. With filtering active, key-management requests are refused
//! 6. Everything else is relayed unmodified, one frame at a time

pub mod protocol;

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::UnixStream;

use crate::allowlist::AllowList;
use crate::error::{PodError, PodResult};
use crate::proxy::{ConnectionHandler, ProxyServer, ProxyState};

use protocol::{AgentIdentity, ProtocolError};

/// File name of the proxy socket inside its private directory.
pub const SOCKET_NAME: &str = "agent.sock";

/// Check that `path` exists and is a Unix socket.
pub(crate) fn validate_upstream_socket(path: &Path, what: &str) -> PodResult<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        PodError::Config(format!("{what} socket {} is not usable: {e}", path.display()))
    })?;
    if !meta.file_type().is_socket() {
        return Err(PodError::Config(format!(
            "{what} path {} is not a socket",
            path.display()
        )));
    }
    Ok(())
}

/// Keep only identities whose comment or fingerprint is allow-listed.
pub fn filter_identities(identities: Vec<AgentIdentity>, allow: &AllowList) -> Vec<AgentIdentity> {
    if allow.is_passthrough() {
        return identities;
    }
    identities
        .into_iter()
        .filter(|identity| identity_allowed(identity, allow))
        .collect()
}

fn identity_allowed(identity: &AgentIdentity, allow: &AllowList) -> bool {
    let fingerprint = identity.fingerprint();
    allow.matches_any([identity.comment.as_str(), fingerprint.as_str()])
}

/// SSH agent proxy owned by one container session.
pub struct SshAgentProxy {
    allow_list: Arc<AllowList>,
    server: ProxyServer<SshRelay>,
}

impl SshAgentProxy {
    /// Create a proxy for the agent listening on `upstream`.
    ///
    /// Fails with [`PodError::Config`] when `upstream` does not exist or is
    /// not a socket.
    pub fn new(upstream: impl Into<PathBuf>, allow_list: AllowList) -> PodResult<Self> {
        let upstream = upstream.into();
        validate_upstream_socket(&upstream, "SSH agent")?;

        let allow_list = Arc::new(allow_list);
        let relay = SshRelay {
            upstream,
            allow_list: Arc::clone(&allow_list),
        };

        Ok(Self {
            allow_list,
            server: ProxyServer::new("ssh", SOCKET_NAME, relay),
        })
    }

    /// Create the private socket directory under `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.server.set_base_dir(dir.into());
        self
    }

    /// Bind the local socket and start serving. Requires a tokio runtime.
    pub fn start(&self) -> PodResult<PathBuf> {
        self.server.start()
    }

    /// Idempotent shutdown; removes the socket directory.
    pub async fn stop(&self) {
        self.server.stop().await;
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.server.socket_path()
    }

    pub fn socket_dir(&self) -> Option<PathBuf> {
        self.server.socket_dir()
    }

    pub fn state(&self) -> ProxyState {
        self.server.state()
    }

    pub fn is_filtering(&self) -> bool {
        !self.allow_list.is_passthrough()
    }
}

struct SshRelay {
    upstream: PathBuf,
    allow_list: Arc<AllowList>,
}

/// Per-connection state: the upstream stream and the comments the upstream
/// agent reported for each key blob.
struct Session {
    upstream: UnixStream,
    comments: HashMap<Vec<u8>, String>,
}

impl Session {
    async fn round_trip(&mut self, request: &[u8]) -> PodResult<Vec<u8>> {
        protocol::write_frame(&mut self.upstream, request)
            .await
            .map_err(|e| PodError::relay("upstream write", e))?;
        protocol::read_frame(&mut self.upstream)
            .await
            .map_err(|e| PodError::relay("upstream read", e))?
            .ok_or_else(|| PodError::Relay("upstream agent closed the connection".to_string()))
    }

    fn remember(&mut self, identities: &[AgentIdentity]) {
        for identity in identities {
            self.comments
                .insert(identity.blob.clone(), identity.comment.clone());
        }
    }

    /// Comment for a key blob, asking the upstream agent for its identity
    /// list if this connection has not seen the key yet. The key itself is
    /// never sent upstream.
    async fn comment_for(&mut self, blob: &[u8]) -> PodResult<Option<String>> {
        if let Some(comment) = self.comments.get(blob) {
            return Ok(Some(comment.clone()));
        }

        let response = self
            .round_trip(&[protocol::SSH_AGENTC_REQUEST_IDENTITIES])
            .await?;
        match protocol::parse_identities_answer(&response) {
            Ok(identities) => self.remember(&identities),
            Err(e) => debug!("Could not refresh identity list: {}", e),
        }
        Ok(self.comments.get(blob).cloned())
    }
}

impl SshRelay {
    async fn dispatch(&self, session: &mut Session, request: &[u8]) -> PodResult<Vec<u8>> {
        let Some(&msg_type) = request.first() else {
            return Ok(protocol::failure());
        };
        let filtering = !self.allow_list.is_passthrough();

        match msg_type {
            protocol::SSH_AGENTC_REQUEST_IDENTITIES => {
                let response = session.round_trip(request).await?;
                if !filtering {
                    return Ok(response);
                }
                match protocol::parse_identities_answer(&response) {
                    Ok(identities) => {
                        session.remember(&identities);
                        let total = identities.len();
                        let allowed = filter_identities(identities, &self.allow_list);
                        debug!("Exposing {} of {} identities", allowed.len(), total);
                        Ok(protocol::encode_identities_answer(&allowed))
                    }
                    Err(ProtocolError::UnexpectedType(protocol::SSH_AGENT_FAILURE)) => {
                        Ok(response)
                    }
                    Err(e) => {
                        warn!("Malformed identity list from upstream agent: {}", e);
                        Ok(protocol::failure())
                    }
                }
            }

            protocol::SSH_AGENTC_SIGN_REQUEST if filtering => {
                let blob = match protocol::sign_request_key(request) {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!("Rejecting malformed sign request: {}", e);
                        return Ok(protocol::failure());
                    }
                };

                if self.sign_allowed(session, blob).await? {
                    session.round_trip(request).await
                } else {
                    warn!(
                        "Denied sign request for key {} (not in allow-list)",
                        protocol::fingerprint(blob)
                    );
                    Ok(protocol::failure())
                }
            }

            t if filtering && protocol::is_key_management(t) => {
                warn!("Blocked key management operation: {}", t);
                Ok(protocol::failure())
            }

            _ => session.round_trip(request).await,
        }
    }

    async fn sign_allowed(&self, session: &mut Session, blob: &[u8]) -> PodResult<bool> {
        let fingerprint = protocol::fingerprint(blob);
        if self.allow_list.matches(&fingerprint) {
            return Ok(true);
        }
        let comment = session.comment_for(blob).await?;
        Ok(comment.is_some_and(|c| self.allow_list.matches(&c)))
    }
}

#[async_trait]
impl ConnectionHandler for SshRelay {
    async fn handle(&self, mut client: UnixStream) -> PodResult<()> {
        let upstream = UnixStream::connect(&self.upstream)
            .await
            .map_err(|e| PodError::relay("connecting to upstream agent", e))?;
        let mut session = Session {
            upstream,
            comments: HashMap::new(),
        };

        loop {
            let request = match protocol::read_frame(&mut client).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("SSH client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    debug!("SSH client read failed: {}", e);
                    return Ok(());
                }
            };

            let response = self.dispatch(&mut session, &request).await?;
            protocol::write_frame(&mut client, &response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8, comment: &str) -> AgentIdentity {
        let mut blob = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x20".to_vec();
        blob.extend_from_slice(&[seed; 32]);
        AgentIdentity::new(blob, comment)
    }

    #[test]
    fn test_filter_passthrough_keeps_everything() {
        let ids = vec![identity(1, "a"), identity(2, "b")];
        assert_eq!(filter_identities(ids.clone(), &AllowList::passthrough()), ids);
    }

    #[test]
    fn test_filter_by_comment() {
        let ids = vec![identity(1, "work"), identity(2, "personal")];
        let allow = AllowList::new(["work"]).unwrap();
        let filtered = filter_identities(ids, &allow);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].comment, "work");
    }

    #[test]
    fn test_filter_by_fingerprint() {
        let wanted = identity(2, "personal");
        let allow = AllowList::new([wanted.fingerprint()]).unwrap();
        let filtered = filter_identities(vec![identity(1, "work"), wanted.clone()], &allow);
        assert_eq!(filtered, vec![wanted]);
    }

    #[test]
    fn test_new_rejects_missing_socket() {
        let err = SshAgentProxy::new("/nonexistent/agent.sock", AllowList::passthrough())
            .err()
            .unwrap();
        assert!(matches!(err, PodError::Config(_)));
    }

    #[test]
    fn test_new_rejects_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = SshAgentProxy::new(file.path(), AllowList::passthrough())
            .err()
            .unwrap();
        assert!(matches!(err, PodError::Config(_)));
    }
}
