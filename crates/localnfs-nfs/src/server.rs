//! NFS server lifecycle.
//!
//! [`NfsServer::start`] opens the adapter over the configured root, binds an
//! nfsserve TCP listener and serves it on a background task.
//! [`NfsServer::stop`] aborts that task and commits outstanding writes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use localnfs_core::{AdapterConfig, ExportList, ExportParseError, FsError, LocalFs};
use nfsserve::tcp::{NFSTcp, NFSTcpListener};
use tempfile::TempDir;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::filesystem::LocalNFS;
use crate::pool::DEFAULT_BLOCKING_PERMITS;

/// Standard NFS port.
pub const DEFAULT_PORT: u16 = 2049;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to create scratch export root: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to load export table: {0}")]
    Exports(#[from] ExportParseError),

    #[error("failed to open export root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("failed to bind NFS server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to flush adapter state: {0}")]
    Shutdown(#[source] FsError),
}

/// Configuration for [`NfsServer`].
///
/// # Example
///
/// ```
/// use localnfs_nfs::ServerConfig;
///
/// let config = ServerConfig::default().with_port(0).with_root("/srv/export");
/// assert_eq!(config.name(), "nfs@0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port to listen on; 0 picks a free one.
    pub port: u16,
    pub bind_ip: IpAddr,
    /// Directory to serve. A scratch directory is created when unset.
    pub root: Option<PathBuf>,
    /// exports(5) file. The built-in table exports `/` read-write when unset.
    pub exports: Option<PathBuf>,
    /// Service name used in logs, `nfs@<port>` when unset.
    pub name: Option<String>,
    /// Journal directory for durable handles.
    pub state_dir: Option<PathBuf>,
    /// Maximum number of adapter calls running at once.
    pub blocking_permits: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            root: None,
            exports: None,
            name: None,
            state_dir: None,
            blocking_permits: DEFAULT_BLOCKING_PERMITS,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_exports(mut self, exports: impl Into<PathBuf>) -> Self {
        self.exports = Some(exports.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    #[must_use]
    pub fn with_blocking_permits(mut self, permits: usize) -> Self {
        self.blocking_permits = permits;
        self
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("nfs@{}", self.port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

/// A running NFS server.
///
/// Dropping the server aborts the listener task without committing
/// unstable writes; call [`NfsServer::stop`] for an orderly shutdown.
pub struct NfsServer {
    name: String,
    local_addr: SocketAddr,
    fs: Arc<LocalFs>,
    task: Option<JoinHandle<()>>,
    /// Keeps a scratch export root alive for the server's lifetime.
    _scratch: Option<TempDir>,
}

impl std::fmt::Debug for NfsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsServer")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("root", &self.fs.root())
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl NfsServer {
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let (root, scratch) = match &config.root {
            Some(root) => (root.clone(), None),
            None => {
                let dir = TempDir::new().map_err(ServerError::Scratch)?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        let exports = match &config.exports {
            Some(path) => ExportList::load(path)?,
            None => ExportList::default(),
        };

        let mut adapter_config = AdapterConfig::new(&root);
        if let Some(state_dir) = &config.state_dir {
            adapter_config = adapter_config.with_state_dir(state_dir);
        }
        let fs = LocalFs::with_exports(adapter_config, exports).map_err(|source| {
            ServerError::Root {
                path: root.clone(),
                source,
            }
        })?;
        let fs = Arc::new(fs);

        let addr = config.socket_addr();
        let nfs = LocalNFS::new(Arc::clone(&fs), config.blocking_permits);
        let listener = NFSTcpListener::bind(&addr.to_string(), nfs)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = SocketAddr::new(config.bind_ip, listener.get_listen_port());

        let name = config.name.clone().unwrap_or_else(|| format!("nfs@{}", local_addr.port()));
        info!(
            name = %name,
            addr = %local_addr,
            root = %fs.root().display(),
            scratch = scratch.is_some(),
            "NFS server listening"
        );

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = listener.handle_forever().await {
                error!(name = %task_name, error = %e, "NFS server error");
            }
        });

        Ok(Self {
            name,
            local_addr,
            fs,
            task: Some(task),
            _scratch: scratch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is bound to, with the actual port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn fs(&self) -> &Arc<LocalFs> {
        &self.fs
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop listening and commit outstanding unstable writes.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(name = %self.name, error = %e, "NFS server task failed");
            }
        }
        debug!(name = %self.name, "NFS server stopped, flushing adapter");
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || fs.shutdown())
            .await
            .unwrap_or_else(|e| Err(FsError::Io(std::io::Error::other(e.to_string()))))
            .map_err(ServerError::Shutdown)?;
        info!(name = %self.name, "NFS server shut down");
        Ok(())
    }
}

impl Drop for NfsServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 2049);
        assert_eq!(config.name(), "nfs@2049");
        assert_eq!(config.blocking_permits, DEFAULT_BLOCKING_PERMITS);
        assert!(config.root.is_none());
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:2049");
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::default()
            .with_port(12049)
            .with_name("scratch")
            .with_bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .with_blocking_permits(4);
        assert_eq!(config.name(), "scratch");
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:12049");
        assert_eq!(config.blocking_permits, 4);
    }

    #[tokio::test]
    async fn test_missing_exports_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::default()
            .with_port(0)
            .with_root(root.path())
            .with_exports(root.path().join("no-such-exports"));
        assert!(matches!(
            NfsServer::start(config).await,
            Err(ServerError::Exports(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::default()
            .with_port(0)
            .with_root(root.path().join("missing"));
        assert!(matches!(
            NfsServer::start(config).await,
            Err(ServerError::Root { .. })
        ));
    }
}
