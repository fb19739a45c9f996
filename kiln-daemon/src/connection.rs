// SPDX-License-Identifier: MIT

//! Per-connection protocol handler.
//!
//! Each accepted connection carries exactly one request and at most one
//! response. While the compilation runs, a second job watches the
//! connection for a client-side close so a dead client never keeps a
//! compilation alive. Every failure path is folded into the returned
//! [`ConnectionOutcome`]; nothing escapes to the dispatcher as an error.

use std::pin::pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_protocol::{BuildResponse, ProtocolError, RunRequest, wire};

use crate::compiler::{CompilerDispatch, CompilerJob};
use crate::dispatch::{CompletionReason, ConnectionOutcome};

/// Service one client connection from raw stream to outcome. Never fails;
/// unexpected errors become [`CompletionReason::ClientException`].
pub async fn handle_connection<S, C>(
    stream: S,
    compilers: C,
    allow_new_work: bool,
    cancel: CancellationToken,
) -> ConnectionOutcome
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    C: CompilerDispatch,
{
    match serve_connection(stream, &compilers, allow_new_work, cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("Unexpected failure while servicing connection: {err}");
            ConnectionOutcome::new(CompletionReason::ClientException, None)
        }
    }
}

async fn serve_connection<S, C>(
    stream: S,
    compilers: &C,
    allow_new_work: bool,
    cancel: CancellationToken,
) -> Result<ConnectionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    C: CompilerDispatch,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    // A stream that closes or garbles before delivering a full request
    // terminates only this connection; nothing is written back.
    let request = match wire::read_request(&mut reader).await {
        Ok(request) => request,
        Err(err) => {
            debug!("Failed to read request: {err}");
            return Ok(ConnectionOutcome::new(
                CompletionReason::CompilationNotStarted,
                None,
            ));
        }
    };

    // Extracted up front: the keep-alive override counts whether or not the
    // compilation goes anywhere.
    let requested_keep_alive = request.keep_alive_override();

    if request.is_shutdown_request() {
        info!("Client requested server shutdown");
        let response = BuildResponse::Shutdown {
            server_pid: std::process::id(),
        };
        let reason = match write_checked(&mut writer, &response).await? {
            WriteStatus::Delivered => CompletionReason::ClientShutdownRequest,
            WriteStatus::PeerGone => CompletionReason::ClientDisconnect,
        };
        return Ok(ConnectionOutcome::new(reason, requested_keep_alive));
    }

    if !allow_new_work {
        // New connections are refused at the listener; anything that made it
        // this far is serviced to completion even during shutdown.
        debug!("Servicing in-flight request while the server is shutting down");
    }

    let job_cancel = cancel.child_token();
    let mut execute = pin!(execute_request(compilers, &request, job_cancel.clone()));

    let reason = tokio::select! {
        response = &mut execute => {
            match write_checked(&mut writer, &response).await? {
                WriteStatus::Delivered => CompletionReason::CompilationCompleted,
                WriteStatus::PeerGone => {
                    debug!("Client disconnected before the response was delivered");
                    CompletionReason::ClientDisconnect
                }
            }
        }
        () = monitor_disconnect(&mut reader) => {
            info!(language = %request.language, "Client disconnected during compilation");
            // Signal the job and let it wind down; its result has no
            // recipient and is discarded.
            job_cancel.cancel();
            let _ = execute.await;
            CompletionReason::ClientDisconnect
        }
    };

    Ok(ConnectionOutcome::new(reason, requested_keep_alive))
}

/// Resolve a compiler for the request and run it.
async fn execute_request<C>(
    compilers: &C,
    request: &RunRequest,
    cancel: CancellationToken,
) -> BuildResponse
where
    C: CompilerDispatch,
{
    let Some(job) = compilers.try_create(request) else {
        info!(language = %request.language, "No compiler registered for language");
        return BuildResponse::unknown_language();
    };

    if !job.analyzers_consistent() {
        warn!(language = %request.language, "Analyzer set inconsistent, refusing to compile");
        return BuildResponse::AnalyzerInconsistency {
            messages: vec![
                "the requested analyzer set no longer matches what this server has loaded".into(),
            ],
        };
    }

    debug!(language = %request.language, "Starting compilation");
    BuildResponse::Completed(job.run(cancel).await)
}

enum WriteStatus {
    Delivered,
    PeerGone,
}

/// Write the response, folding transport failures into `PeerGone`. Non-IO
/// failures (a response we cannot encode) propagate and become
/// `ClientException` upstream.
async fn write_checked<W>(
    writer: &mut W,
    response: &BuildResponse,
) -> Result<WriteStatus, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    match wire::write_response(writer, response).await {
        Ok(()) => Ok(WriteStatus::Delivered),
        Err(err) if err.is_io() => {
            debug!("Failed to deliver response: {err}");
            Ok(WriteStatus::PeerGone)
        }
        Err(err) => Err(err),
    }
}

/// Completes once the client side of the connection is observed to be gone.
///
/// A well-behaved client sends nothing after its single request, so any
/// read completion — EOF, error, or stray bytes — means the peer
/// disconnected or broke the one-request-per-connection contract.
async fn monitor_disconnect<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    let _ = reader.read(&mut buf).await;
}
