// SPDX-License-Identifier: MIT

//! Connection transport: where new client connections come from.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tracing::info;

use crate::error::{DaemonError, IoContext};

/// Produces one pending "next connection" at a time for the dispatcher.
///
/// `accept` must be cancel-safe: the dispatcher drops the pending future
/// when it stops listening, and no accepted connection may be lost that
/// way.
pub trait ConnectionListener: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Listens on a unix domain socket.
pub struct UnixSocketListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl UnixSocketListener {
    pub fn bind(socket_path: &Path) -> Result<Self, DaemonError> {
        // Remove existing socket file if present
        if socket_path.exists() {
            std::fs::remove_file(socket_path).io_context(|| {
                format!("Failed to remove stale socket at {}", socket_path.display())
            })?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).io_context(|| {
                format!("Failed to create socket directory {}", parent.display())
            })?;
        }

        let listener = UnixListener::bind(socket_path)
            .io_context(|| format!("Failed to bind to socket path {}", socket_path.display()))?;

        // Make socket world-accessible so other users can connect
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(socket_path, perms).io_context(|| {
                format!(
                    "Failed to set permissions on socket at {}",
                    socket_path.display()
                )
            })?;
        }

        info!("Listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl ConnectionListener for UnixSocketListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}
