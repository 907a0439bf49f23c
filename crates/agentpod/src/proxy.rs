//! Listener lifecycle shared by the SSH and GPG agent proxies.
//!
//! A [`ProxyServer`] owns a private temp directory with the listening socket
//! inside, an accept loop task, and one task per client connection. All of
//! them are torn down through a single cancellation token.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{PodError, PodResult};
use crate::temp_registry::TempResourceRegistry;

/// How long `stop()` waits for in-flight tasks before abandoning them.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyState::Created => write!(f, "created"),
            ProxyState::Running => write!(f, "running"),
            ProxyState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-connection protocol logic plugged into a [`ProxyServer`].
#[async_trait]
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one client until it disconnects. Errors only affect this client.
    async fn handle(&self, client: UnixStream) -> PodResult<()>;
}

struct Inner {
    state: ProxyState,
    temp_dir: Option<TempDir>,
    socket_path: Option<PathBuf>,
    accept_task: Option<JoinHandle<()>>,
}

pub(crate) struct ProxyServer<H> {
    label: &'static str,
    socket_name: &'static str,
    handler: Arc<H>,
    base_dir: Option<PathBuf>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl<H: ConnectionHandler> ProxyServer<H> {
    pub(crate) fn new(label: &'static str, socket_name: &'static str, handler: H) -> Self {
        Self {
            label,
            socket_name,
            handler: Arc::new(handler),
            base_dir: None,
            cancel: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: ProxyState::Created,
                temp_dir: None,
                socket_path: None,
                accept_task: None,
            }),
        }
    }

    /// Create the private temp directory under `dir` instead of the system
    /// temp directory.
    pub(crate) fn set_base_dir(&mut self, dir: PathBuf) {
        self.base_dir = Some(dir);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ProxyState {
        self.lock().state
    }

    pub(crate) fn socket_path(&self) -> Option<PathBuf> {
        self.lock().socket_path.clone()
    }

    pub(crate) fn socket_dir(&self) -> Option<PathBuf> {
        self.lock()
            .temp_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    /// Bind the socket and spawn the accept loop.
    ///
    /// Must be called from within a tokio runtime. Starting a running proxy
    /// returns its socket path again; a stopped proxy cannot be restarted.
    pub(crate) fn start(&self) -> PodResult<PathBuf> {
        let mut inner = self.lock();
        match inner.state {
            ProxyState::Running => {
                if let Some(ref path) = inner.socket_path {
                    return Ok(path.clone());
                }
            }
            ProxyState::Stopped => {
                return Err(PodError::Config(format!(
                    "{} proxy was stopped and cannot be restarted",
                    self.label
                )));
            }
            ProxyState::Created => {}
        }

        let temp_dir = create_private_dir(self.label, self.base_dir.as_deref())?;
        let socket_path = temp_dir.path().join(self.socket_name);

        let listener = UnixListener::bind(&socket_path).map_err(|source| PodError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        std::fs::set_permissions(&socket_path, Permissions::from_mode(0o600)).map_err(
            |source| PodError::Bind {
                path: socket_path.clone(),
                source,
            },
        )?;

        TempResourceRegistry::global().register(temp_dir.path());

        let task = tokio::spawn(accept_loop(
            self.label,
            listener,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        ));

        info!("{} proxy listening on {:?}", self.label, socket_path);

        inner.state = ProxyState::Running;
        inner.temp_dir = Some(temp_dir);
        inner.socket_path = Some(socket_path.clone());
        inner.accept_task = Some(task);

        Ok(socket_path)
    }

    /// Stop accepting, cancel relays and remove the temp directory.
    ///
    /// Idempotent and safe to call from any task.
    pub(crate) async fn stop(&self) {
        let (task, temp_dir) = {
            let mut inner = self.lock();
            if inner.state == ProxyState::Stopped {
                return;
            }
            inner.state = ProxyState::Stopped;
            inner.socket_path = None;
            (inner.accept_task.take(), inner.temp_dir.take())
        };

        self.cancel.cancel();

        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(
                    "{} proxy did not stop within {:?}, abandoning remaining tasks",
                    self.label, STOP_TIMEOUT
                );
                abort.abort();
            }
        }

        if let Some(dir) = temp_dir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove {} proxy directory {:?}: {}", self.label, path, e);
            }
            TempResourceRegistry::global().unregister(&path);
        }

        debug!("{} proxy stopped", self.label);
    }
}

impl<H> Drop for ProxyServer<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = inner.accept_task.take() {
            task.abort();
        }
        if let Some(dir) = inner.temp_dir.take() {
            TempResourceRegistry::global().unregister(dir.path());
        }
    }
}

/// Create a fresh `0700` directory for one proxy instance.
fn create_private_dir(label: &str, base: Option<&Path>) -> PodResult<TempDir> {
    let prefix = format!("{label}-");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);

    let bind_err = |source| PodError::Bind {
        path: base.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
        source,
    };

    let dir = match base {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    }
    .map_err(bind_err)?;

    std::fs::set_permissions(dir.path(), Permissions::from_mode(0o700)).map_err(bind_err)?;
    Ok(dir)
}

async fn accept_loop<H: ConnectionHandler>(
    label: &'static str,
    listener: UnixListener,
    handler: Arc<H>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        debug!("{} proxy: new client connection", label);
                        let handler = Arc::clone(&handler);
                        let token = cancel.child_token();
                        connections.spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                result = handler.handle(stream) => {
                                    if let Err(e) = result {
                                        warn!("{} proxy: closing client connection: {}", label, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("{} proxy: accept error: {}", label, e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Dropping the streams held by the aborted tasks closes their sockets.
    drop(listener);
    connections.shutdown().await;
}
