//! Filtering GPG agent proxy.
//!
//! Relays the Assuan line protocol between a client in the container and the
//! host's gpg-agent. Commands naming keygrips outside the allow-list are
//! answered locally, and `S KEYINFO` lines for hidden keys are dropped from
//! the agent's responses.

pub mod assuan;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::allowlist::AllowList;
use crate::error::{PodError, PodResult};
use crate::proxy::{ConnectionHandler, ProxyServer, ProxyState};
use crate::ssh_agent::validate_upstream_socket;

use assuan::{MAX_LINE_LEN, Verdict};

/// File name gpg expects for the agent socket.
pub const SOCKET_NAME: &str = "S.gpg-agent";

/// GPG agent proxy owned by one container session.
pub struct GpgAgentProxy {
    allow_list: Arc<AllowList>,
    server: ProxyServer<GpgRelay>,
}

impl GpgAgentProxy {
    /// Create a proxy for the gpg-agent listening on `upstream`.
    pub fn new(upstream: impl Into<PathBuf>, allow_list: AllowList) -> PodResult<Self> {
        let upstream = upstream.into();
        validate_upstream_socket(&upstream, "GPG agent")?;

        let allow_list = Arc::new(allow_list);
        let relay = GpgRelay {
            upstream,
            allow_list: Arc::clone(&allow_list),
        };

        Ok(Self {
            allow_list,
            server: ProxyServer::new("gpg", SOCKET_NAME, relay),
        })
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.server.set_base_dir(dir.into());
        self
    }

    pub fn start(&self) -> PodResult<PathBuf> {
        self.server.start()
    }

    pub async fn stop(&self) {
        self.server.stop().await;
    }

    /// Exact socket file.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.server.socket_path()
    }

    /// Directory holding the socket, for consumers that expect a
    /// gnupg-home style layout.
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

struct GpgRelay {
    upstream: PathBuf,
    allow_list: Arc<AllowList>,
}

async fn send_line<W>(writer: &Mutex<W>, line: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(line).await?;
    writer.flush().await
}

impl GpgRelay {
    /// Client -> agent. Returns when the client goes away.
    async fn pump_requests<R, W, C>(
        &self,
        client: &mut BufReader<R>,
        upstream: &mut W,
        client_writer: &Mutex<C>,
    ) -> PodResult<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        C: AsyncWrite + Unpin,
    {
        loop {
            let line = match assuan::read_line(client, MAX_LINE_LEN).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("GPG client disconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!("GPG client connection closed: {}", e);
                    return Ok(());
                }
            };

            match assuan::check_command(&line, &self.allow_list) {
                Verdict::Forward => {
                    upstream
                        .write_all(&line)
                        .await
                        .map_err(|e| PodError::relay("upstream write", e))?;
                    upstream
                        .flush()
                        .await
                        .map_err(|e| PodError::relay("upstream write", e))?;
                }
                Verdict::Reject(reply) => {
                    let name = assuan::Command::parse(&line)
                        .map(|c| c.name)
                        .unwrap_or_default();
                    warn!("Denied GPG agent command {} (not in allow-list)", name);
                    send_line(client_writer, reply).await?;
                }
            }
        }
    }

    /// Agent -> client. Returns when the agent closes the connection.
    async fn pump_responses<R, C>(
        &self,
        upstream: &mut BufReader<R>,
        client_writer: &Mutex<C>,
    ) -> PodResult<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        C: AsyncWrite + Unpin,
    {
        while let Some(line) = assuan::read_line(upstream, MAX_LINE_LEN)
            .await
            .map_err(|e| PodError::relay("upstream read", e))?
        {
            if assuan::response_allowed(&line, &self.allow_list) {
                send_line(client_writer, &line).await?;
            } else {
                debug!("Dropped KEYINFO line for a hidden key");
            }
        }
        debug!("GPG agent closed the connection");
        Ok(())
    }
}

#[async_trait]
impl ConnectionHandler for GpgRelay {
    async fn handle(&self, client: UnixStream) -> PodResult<()> {
        let upstream = UnixStream::connect(&self.upstream)
            .await
            .map_err(|e| PodError::relay("connecting to upstream agent", e))?;

        let (client_read, client_write) = client.into_split();
        let (upstream_read, mut upstream_write) = upstream.into_split();
        let mut client_read = BufReader::new(client_read);
        let mut upstream_read = BufReader::new(upstream_read);
        let client_write = Mutex::new(client_write);

        // Each response line is written before the next one is read, so
        // whichever side finishes first has nothing left in flight.
        tokio::select! {
            result = self.pump_requests(&mut client_read, &mut upstream_write, &client_write) => result,
            result = self.pump_responses(&mut upstream_read, &client_write) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_missing_socket() {
        let err = GpgAgentProxy::new("/nonexistent/S.gpg-agent", AllowList::passthrough())
            .err()
            .unwrap();
        assert!(matches!(err, PodError::Config(_)));
    }

    #[tokio::test]
    async fn test_socket_layout() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("S.gpg-agent");
        let _listener = tokio::net::UnixListener::bind(&upstream).unwrap();

        let proxy = GpgAgentProxy::new(&upstream, AllowList::passthrough()).unwrap();
        assert_eq!(proxy.state(), ProxyState::Created);
        let path = proxy.start().unwrap();
        assert_eq!(path.file_name().unwrap(), SOCKET_NAME);
        assert_eq!(proxy.socket_dir().as_deref(), path.parent());
        assert!(!proxy.is_filtering());

        proxy.stop().await;
        assert_eq!(proxy.state(), ProxyState::Stopped);
        assert!(!path.exists());
    }
}
