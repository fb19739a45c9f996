// SPDX-License-Identifier: MIT

//! Thin client for the kiln build server daemon.
//!
//! The protocol is one request and one response per connection, so the
//! client holds no open connection between calls; each call dials the
//! daemon's unix socket afresh.

use std::path::{Path, PathBuf};

use tokio::net::UnixStream;

use kiln_protocol::{
    Argument, BuildResponse, IoContext, ProtocolError, RunRequest, wire,
};

#[derive(Debug, Clone)]
pub struct BuildClient {
    socket_path: PathBuf,
}

impl BuildClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one compilation request and wait for its response.
    pub async fn run(&self, request: &RunRequest) -> Result<BuildResponse, ProtocolError> {
        let mut stream = self.connect().await?;
        wire::write_request(&mut stream, request).await?;
        wire::read_response(&mut stream).await
    }

    /// Ask the server to shut down. Returns the server's process id so the
    /// caller can wait for the process to actually exit.
    pub async fn request_shutdown(&self) -> Result<u32, ProtocolError> {
        let request = RunRequest {
            language: String::new(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![Argument::shutdown()],
        };
        match self.run(&request).await? {
            BuildResponse::Shutdown { server_pid } => Ok(server_pid),
            _ => Err(ProtocolError::UnexpectedResponse {
                expected: "shutdown acknowledgement",
            }),
        }
    }

    async fn connect(&self) -> Result<UnixStream, ProtocolError> {
        UnixStream::connect(&self.socket_path)
            .await
            .io_context(format!(
                "Failed to connect to build server at {}",
                self.socket_path.display()
            ))
    }
}
