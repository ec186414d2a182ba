//! digitme daemon entrypoint.
//!
//! Tracks editor sessions and focus intervals on a single timeline, relays
//! them to the remote aggregation service and buffers them on local disk
//! whenever that service is unreachable.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

mod backoff;
mod batch;
mod buffer;
mod config;
mod editor;
mod logging;
mod relay;
mod remote;
mod runtime;
mod session;
mod timer;
mod tracker;

use buffer::LocalBuffer;
use config::ConfigOverrides;
use remote::{LinkConfig, RemoteLink};
use runtime::{Runtime, RuntimeOptions};

const CONNECT_ATTEMPT_TIMEOUT_SECS: u64 = 10;
const PUSH_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "digitme-daemon")]
#[command(about = "Editor activity tracker and relay")]
#[command(version)]
struct Cli {
    /// Remote aggregation service host
    #[arg(long, env = "DIGITME_HOST")]
    host: Option<String>,

    /// Remote aggregation service port
    #[arg(long, env = "DIGITME_PORT")]
    port: Option<u16>,

    /// Port the editor listener binds on 127.0.0.1
    #[arg(long, env = "DIGITME_EDITOR_PORT")]
    editor_port: Option<u16>,

    /// Local buffer directory (defaults to ~/.digitalme)
    #[arg(long, env = "DIGITME_BUFFER_DIR", value_name = "DIR")]
    buffer_dir: Option<PathBuf>,

    /// Config file (defaults to config.toml in the buffer directory)
    #[arg(long, env = "DIGITME_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            editor_port: self.editor_port,
            buffer_dir: self.buffer_dir.clone(),
            config: self.config.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init();

    let overrides = cli.overrides();
    let (config, buffer_dir) = match config::resolve(&overrides) {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            match config::resolve_defaults(&overrides) {
                Ok(resolved) => resolved,
                Err(err) => {
                    error!(error = %err, "Failed to resolve buffer directory");
                    std::process::exit(1);
                }
            }
        }
    };

    let buffer = LocalBuffer::new(&buffer_dir);
    if let Err(err) = buffer.provision() {
        error!(error = %err, path = %buffer_dir.display(), "Failed to provision buffer directory");
        std::process::exit(1);
    }
    match buffer.recover_claims().await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "Restored buffer entries claimed by a previous run"),
        Err(err) => warn!(error = %err, "Failed to recover claimed buffer entries"),
    }

    let editor_address = config.editor.address();
    let listener = match TcpListener::bind(&editor_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, address = %editor_address, "Failed to bind editor listener");
            std::process::exit(1);
        }
    };

    let link = RemoteLink::new(LinkConfig {
        endpoint: config.remote.endpoint(),
        connect_timeout: config.remote.connect_timeout(),
        attempt_timeout: Duration::from_secs(CONNECT_ATTEMPT_TIMEOUT_SECS),
        client_name: format!("digitme-daemon/{}", env!("CARGO_PKG_VERSION")),
    });

    info!(
        editor = %editor_address,
        remote = %link.endpoint(),
        buffer_dir = %buffer_dir.display(),
        "digitme daemon started"
    );

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let supervisor = link.spawn(link_tx);

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (push_tx, _) = broadcast::channel(PUSH_CAPACITY);
    let editor = tokio::spawn(editor::serve(listener, input_tx.clone(), push_tx.clone()));

    let options = RuntimeOptions {
        flush_interval: config.relay.flush_interval(),
        idle_timeout_ms: config.session.idle_timeout_ms,
        default_timer_ms: config.timer.default_interval_ms(),
        timer_intervals: config.timer.intervals_ms(),
        overflow_cap: config.relay.overflow_cap,
    };
    let runtime = Runtime::new(&options, buffer, link.clone(), push_tx, input_tx);
    runtime.run(input_rx, link_rx, shutdown_signal()).await;

    editor.abort();
    supervisor.abort();
    info!("digitme daemon stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
