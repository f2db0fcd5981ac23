//! NFS server for a local directory.
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p localnfs-nfs --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect (default: 127.0.0.1:6669).

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use localnfs_nfs::{DEFAULT_BLOCKING_PERMITS, DEFAULT_PORT, NfsServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "tokio-console")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve a local directory over NFSv3
#[derive(Parser, Debug)]
#[command(name = "localnfs", version, about)]
struct Args {
    /// Directory to export (default: a scratch directory removed on exit)
    #[arg(short, long, env = "LOCALNFS_ROOT")]
    root: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "LOCALNFS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// exports(5) file (default: export everything read-write)
    #[arg(short, long, env = "LOCALNFS_EXPORTS")]
    exports: Option<PathBuf>,

    /// Directory for the handle journal; handles survive restarts when set
    #[arg(short, long, env = "LOCALNFS_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Service name used in logs
    #[arg(short, long)]
    name: Option<String>,

    /// Maximum number of filesystem calls in flight
    #[arg(long, default_value_t = DEFAULT_BLOCKING_PERMITS)]
    blocking_permits: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .with_port(self.port)
            .with_bind_ip(self.bind)
            .with_blocking_permits(self.blocking_permits);
        if let Some(root) = self.root {
            config = config.with_root(root);
        }
        if let Some(exports) = self.exports {
            config = config.with_exports(exports);
        }
        if let Some(state_dir) = self.state_dir {
            config = config.with_state_dir(state_dir);
        }
        if let Some(name) = self.name {
            config = config.with_name(name);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    #[cfg(feature = "tokio-console")]
    {
        // console_subscriber brings its own filter for tokio instrumentation;
        // the fmt layer gets the RUST_LOG filter.
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);

        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();
        let port_available = std::net::TcpListener::bind(console_addr).is_ok();

        let fmt_filter = EnvFilter::from_default_env();

        if port_available {
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            tracing::info!(
                "tokio-console enabled, connect with: tokio-console http://127.0.0.1:{}",
                console_port
            );
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            tracing::warn!(
                "tokio-console port {} already in use, running without console instrumentation. \
                 Set TOKIO_CONSOLE_PORT to use a different port.",
                console_port
            );
        }
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = args.into_config();
    let root = config.root.clone();

    let server = NfsServer::start(config)
        .await
        .with_context(|| match &root {
            Some(root) => format!("failed to serve {}", root.display()),
            None => "failed to serve scratch directory".to_string(),
        })?;

    tracing::info!(
        name = server.name(),
        root = %server.fs().root().display(),
        port = server.port(),
        "Serving; mount with: mount -t nfs -o vers=3,tcp,port={0},mountport={0},nolock {1}:/ <mountpoint>",
        server.port(),
        server.local_addr().ip(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");

    server.stop().await.context("failed to stop NFS server")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "localnfs",
            "--root",
            "/srv/export",
            "--port",
            "12049",
            "--state-dir",
            "/var/lib/localnfs",
        ]);
        let config = args.into_config();
        assert_eq!(config.root, Some(PathBuf::from("/srv/export")));
        assert_eq!(config.port, 12049);
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/localnfs")));
        assert_eq!(config.name(), "nfs@12049");
    }

    #[test]
    fn test_args_verify() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
