// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kiln_daemon::compiler::CompilerRegistry;
use kiln_daemon::config::Config;
use kiln_daemon::dispatch::ServerDispatcher;
use kiln_daemon::error::{DaemonError, IoContext};
use kiln_daemon::listener::UnixSocketListener;

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // Load configuration
    let config = match std::env::var("KILN_DAEMON_CONFIG") {
        Ok(path) => Config::from_file(&PathBuf::from(path))?,
        Err(_) => Config::default(),
    };

    // KILN_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_env("KILN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting kiln-daemon");
    info!("Socket path: {}", config.socket_path.display());

    let listener = UnixSocketListener::bind(&config.socket_path)?;
    let socket_path = listener.socket_path().to_path_buf();

    // Compiler front ends are registered by the hosting build; the daemon
    // binary itself ships an empty registry and answers every compilation
    // request with the unknown-language sentinel.
    let compilers = CompilerRegistry::new();

    let dispatcher = ServerDispatcher::new(listener, compilers)
        .idle_gc_delay(config.idle_gc_delay());
    let cancel = CancellationToken::new();
    let mut server = tokio::spawn(dispatcher.run(config.keep_alive(), cancel.clone()));

    // Run until the server shuts itself down (idle timeout or a client
    // event) or a signal asks it to. A signal stops the listener but lets
    // in-flight compilations finish.
    tokio::select! {
        _ = &mut server => {}
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            cancel.cancel();
            if let Err(err) = server.await {
                tracing::error!("Server task failed: {err}");
            }
        }
    }

    // Clean up: remove socket file
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).io_context(|| {
            format!("Failed to remove socket file at {}", socket_path.display())
        })?;
    }

    info!("kiln-daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
