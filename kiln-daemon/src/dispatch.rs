// SPDX-License-Identifier: MIT

//! The server dispatcher: one coordinating loop that owns all server state.
//!
//! The loop keeps exactly one pending accept while running, spawns one task
//! per accepted connection, arms idle-timeout and idle-GC timers whenever
//! the in-flight set drains, and folds every finished connection's outcome
//! back into its own state. Workers never touch dispatcher state; the only
//! thing that crosses back from a connection task is an immutable
//! [`ConnectionOutcome`].

use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compiler::CompilerDispatch;
use crate::connection;
use crate::diagnostics::DiagnosticListener;
use crate::gc;
use crate::keepalive::KeepAlive;
use crate::listener::ConnectionListener;

/// How long the server outlives its last connection unless configured or
/// overridden otherwise.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(600);

/// Delay between the in-flight set draining and the memory-reclaim pass.
pub const DEFAULT_IDLE_GC_DELAY: Duration = Duration::from_secs(30);

/// Why a connection finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The request never made it off the wire (malformed or truncated);
    /// nothing was written back.
    CompilationNotStarted,
    /// A response was delivered, whether the compilation succeeded or not.
    CompilationCompleted,
    /// The byte stream closed before the response could be delivered.
    ClientDisconnect,
    /// An unexpected failure while servicing the connection.
    ClientException,
    /// The client explicitly asked the server to stop.
    ClientShutdownRequest,
}

impl CompletionReason {
    /// The escalation table: which outcomes mean this process can no longer
    /// trust its clients and must begin an orderly shutdown.
    pub fn shuts_down_server(self) -> bool {
        match self {
            Self::CompilationNotStarted | Self::CompilationCompleted => false,
            Self::ClientDisconnect | Self::ClientException | Self::ClientShutdownRequest => true,
        }
    }
}

/// Produced exactly once per connection task, consumed exactly once by the
/// dispatcher's bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub reason: CompletionReason,
    pub requested_keep_alive: Option<Duration>,
}

impl ConnectionOutcome {
    pub fn new(reason: CompletionReason, requested_keep_alive: Option<Duration>) -> Self {
        Self {
            reason,
            requested_keep_alive,
        }
    }
}

/// Monotonic server lifecycle; owned exclusively by the dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    ShuttingDown,
    Completed,
}

enum Event<S> {
    Cancelled,
    Accepted(std::io::Result<S>),
    IdleTimeout,
    IdleGc,
    ConnectionDone(Result<ConnectionOutcome, tokio::task::JoinError>),
}

pub struct ServerDispatcher<L, C, D = ()> {
    listener: L,
    compilers: C,
    diagnostics: D,
    idle_gc_delay: Duration,
}

impl<L, C> ServerDispatcher<L, C> {
    pub fn new(listener: L, compilers: C) -> Self {
        Self::with_diagnostics(listener, compilers, ())
    }
}

impl<L, C, D> ServerDispatcher<L, C, D> {
    pub fn with_diagnostics(listener: L, compilers: C, diagnostics: D) -> Self {
        Self {
            listener,
            compilers,
            diagnostics,
            idle_gc_delay: DEFAULT_IDLE_GC_DELAY,
        }
    }

    pub fn idle_gc_delay(mut self, delay: Duration) -> Self {
        self.idle_gc_delay = delay;
        self
    }
}

impl<L, C, D> ServerDispatcher<L, C, D>
where
    L: ConnectionListener,
    C: CompilerDispatch,
    D: DiagnosticListener,
{
    /// Serve until the server has fully shut down: the idle timeout fired,
    /// `cancel` fired, or a rude client event occurred — and every in-flight
    /// connection has finished.
    pub async fn run(mut self, initial_keep_alive: Option<Duration>, cancel: CancellationToken) {
        let mut keep_alive = KeepAlive::new(initial_keep_alive);
        let mut state = State::Running;
        let mut connections: JoinSet<ConnectionOutcome> = JoinSet::new();
        let mut completed_connections: usize = 0;
        let mut idle_timeout: Option<Pin<Box<Sleep>>> = None;
        let mut idle_gc: Option<Pin<Box<Sleep>>> = None;

        info!("Server dispatcher running");

        while state == State::Running || !connections.is_empty() {
            // Idle jobs exist only while nothing is in flight, one of each.
            if connections.is_empty() {
                if idle_timeout.is_none()
                    && let Some(timeout) = keep_alive.value()
                {
                    debug!(timeout_secs = timeout.as_secs(), "Arming idle timeout");
                    idle_timeout = Some(Box::pin(sleep(timeout)));
                }
                if idle_gc.is_none() {
                    idle_gc = Some(Box::pin(sleep(self.idle_gc_delay)));
                }
            }

            let event: Event<L::Stream> = tokio::select! {
                () = cancel.cancelled(), if state == State::Running => Event::Cancelled,
                accepted = self.listener.accept(), if state == State::Running => {
                    Event::Accepted(accepted)
                }
                () = armed(&mut idle_timeout), if idle_timeout.is_some() => Event::IdleTimeout,
                () = armed(&mut idle_gc), if idle_gc.is_some() => Event::IdleGc,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    Event::ConnectionDone(joined)
                }
            };

            match event {
                Event::Cancelled => {
                    info!("Cancellation requested; no longer accepting connections");
                    state = State::ShuttingDown;
                }
                Event::Accepted(Ok(stream)) => {
                    self.diagnostics.connection_received();
                    // Idleness ends the instant a connection arrives.
                    idle_timeout = None;
                    idle_gc = None;
                    let compilers = self.compilers.clone();
                    let token = cancel.child_token();
                    let allow_new_work = state == State::Running;
                    connections.spawn(connection::handle_connection(
                        stream,
                        compilers,
                        allow_new_work,
                        token,
                    ));
                }
                Event::Accepted(Err(err)) => {
                    // Transport hiccups are non-fatal; the next loop
                    // iteration listens again.
                    warn!("Failed to accept connection: {err}");
                }
                Event::IdleTimeout => {
                    info!("Idle timeout reached, beginning shutdown");
                    self.diagnostics.keep_alive_reached();
                    idle_timeout = None;
                    state = State::ShuttingDown;
                }
                Event::IdleGc => {
                    gc::reclaim_memory();
                    // Cleared so another pass runs if the server stays idle.
                    idle_gc = None;
                }
                Event::ConnectionDone(joined) => {
                    let outcome = joined.unwrap_or_else(|err| {
                        error!("Connection task failed: {err}");
                        ConnectionOutcome::new(CompletionReason::ClientException, None)
                    });
                    completed_connections += 1;
                    self.diagnostics.connection_completed(completed_connections);

                    if let Some(requested) = outcome.requested_keep_alive
                        && keep_alive.update(requested)
                    {
                        info!(
                            keep_alive_secs = requested.as_secs(),
                            "Keep-alive extended by client"
                        );
                        self.diagnostics.update_keep_alive(requested);
                    }

                    if matches!(
                        outcome.reason,
                        CompletionReason::ClientDisconnect | CompletionReason::ClientException
                    ) {
                        self.diagnostics.detected_bad_connection(outcome.reason);
                    }
                    if outcome.reason.shuts_down_server() && state == State::Running {
                        info!(reason = ?outcome.reason, "Connection outcome requires shutdown");
                        state = State::ShuttingDown;
                    }
                }
            }
        }

        state = State::Completed;
        debug!(?state, "Server dispatcher finished");
    }
}

/// Await an armed timer slot; never resolves for an empty slot (the select
/// guard keeps it from being polled in that case anyway).
async fn armed(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use kiln_protocol::{Argument, BuildResponse, CompletedResponse, RunRequest, wire};

    use crate::compiler::RegisteredJob;

    #[derive(Clone)]
    struct TestCompilers {
        delay: Duration,
    }

    impl TestCompilers {
        fn instant() -> Self {
            Self {
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self { delay }
        }
    }

    impl CompilerDispatch for TestCompilers {
        type Job = RegisteredJob;

        fn try_create(&self, _request: &RunRequest) -> Option<RegisteredJob> {
            let delay = self.delay;
            Some(RegisteredJob::new(move |cancel| async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {}
                }
                CompletedResponse {
                    exit_code: 0,
                    utf8_output: true,
                    output: "ok".into(),
                    error_output: String::new(),
                }
            }))
        }
    }

    struct ChannelListener {
        rx: mpsc::Receiver<io::Result<DuplexStream>>,
    }

    impl ChannelListener {
        fn new() -> (mpsc::Sender<io::Result<DuplexStream>>, Self) {
            let (tx, rx) = mpsc::channel(16);
            (tx, Self { rx })
        }
    }

    impl ConnectionListener for ChannelListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<DuplexStream> {
            match self.rx.recv().await {
                Some(result) => result,
                // No more scripted clients; listen forever.
                None => future::pending().await,
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingDiagnostics(Arc<Recorded>);

    #[derive(Default)]
    struct Recorded {
        received: AtomicUsize,
        completed: AtomicUsize,
        keep_alive_reached: AtomicUsize,
        bad_connections: AtomicUsize,
        keep_alive_updates: Mutex<Vec<Duration>>,
    }

    impl DiagnosticListener for RecordingDiagnostics {
        fn connection_received(&self) {
            self.0.received.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_completed(&self, completed_count: usize) {
            self.0.completed.store(completed_count, Ordering::SeqCst);
        }

        fn update_keep_alive(&self, keep_alive: Duration) {
            self.0.keep_alive_updates.lock().unwrap().push(keep_alive);
        }

        fn keep_alive_reached(&self) {
            self.0.keep_alive_reached.fetch_add(1, Ordering::SeqCst);
        }

        fn detected_bad_connection(&self, _reason: CompletionReason) {
            self.0.bad_connections.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn escalation_table_covers_every_reason() {
        assert!(!CompletionReason::CompilationNotStarted.shuts_down_server());
        assert!(!CompletionReason::CompilationCompleted.shuts_down_server());
        assert!(CompletionReason::ClientDisconnect.shuts_down_server());
        assert!(CompletionReason::ClientException.shuts_down_server());
        assert!(CompletionReason::ClientShutdownRequest.shuts_down_server());
    }

    async fn connect(tx: &mpsc::Sender<io::Result<DuplexStream>>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        tx.send(Ok(server)).await.unwrap();
        client
    }

    /// Open a connection, run one full request/response exchange, return the
    /// response.
    async fn exchange(
        tx: &mpsc::Sender<io::Result<DuplexStream>>,
        arguments: Vec<Argument>,
    ) -> BuildResponse {
        let mut client = connect(tx).await;
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: "/src".into(),
            lib_directory: String::new(),
            arguments,
        };
        wire::write_request(&mut client, &request).await.unwrap();
        wire::read_response(&mut client).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_shuts_the_server_down() {
        let (_tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher =
            ServerDispatcher::with_diagnostics(listener, TestCompilers::instant(), diagnostics.clone());

        dispatcher
            .run(Some(Duration::from_secs(1)), CancellationToken::new())
            .await;

        assert_eq!(diagnostics.0.keep_alive_reached.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.0.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_connections_never_trip_the_idle_timeout() {
        let (tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher =
            ServerDispatcher::with_diagnostics(listener, TestCompilers::instant(), diagnostics.clone());
        let server = tokio::spawn(dispatcher.run(
            Some(Duration::from_secs(1000)),
            CancellationToken::new(),
        ));

        for _ in 0..3 {
            let response = exchange(&tx, vec![]).await;
            assert!(matches!(response, BuildResponse::Completed(_)));
        }
        let response = exchange(&tx, vec![Argument::shutdown()]).await;
        assert!(matches!(response, BuildResponse::Shutdown { .. }));

        server.await.unwrap();
        assert_eq!(diagnostics.0.keep_alive_reached.load(Ordering::SeqCst), 0);
        assert_eq!(diagnostics.0.completed.load(Ordering::SeqCst), 4);
        assert_eq!(diagnostics.0.received.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn keep_alive_overrides_accumulate_monotonically() {
        let (tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher =
            ServerDispatcher::with_diagnostics(listener, TestCompilers::instant(), diagnostics.clone());
        let server = tokio::spawn(dispatcher.run(None, CancellationToken::new()));

        // [5s, (no request), 20s, 3s]: the first override replaces the
        // default, the later smaller one is ignored.
        for arguments in [
            vec![Argument::keep_alive(5)],
            vec![],
            vec![Argument::keep_alive(20)],
            vec![Argument::keep_alive(3)],
        ] {
            let response = exchange(&tx, arguments).await;
            assert!(matches!(response, BuildResponse::Completed(_)));
        }
        exchange(&tx, vec![Argument::shutdown()]).await;
        server.await.unwrap();

        let updates = diagnostics.0.keep_alive_updates.lock().unwrap().clone();
        assert_eq!(
            updates,
            vec![Duration::from_secs(5), Duration::from_secs(20)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rude_disconnect_escalates_but_inflight_work_finishes() {
        let (tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher = ServerDispatcher::with_diagnostics(
            listener,
            TestCompilers::slow(Duration::from_secs(5)),
            diagnostics.clone(),
        );
        // No idle timeout: only the rude event can stop this server.
        let server = tokio::spawn(dispatcher.run(None, CancellationToken::new()));

        // A well-behaved slow connection, response awaited concurrently.
        let mut patient = connect(&tx).await;
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![],
        };
        wire::write_request(&mut patient, &request).await.unwrap();
        let patient_response = tokio::spawn(async move {
            wire::read_response(&mut patient).await.unwrap()
        });

        // A rude one: request sent, then the client vanishes mid-compile.
        let mut rude = connect(&tx).await;
        wire::write_request(&mut rude, &request).await.unwrap();
        drop(rude);

        // The dispatcher must not return before the patient connection got
        // its response.
        server.await.unwrap();
        let response = patient_response.await.unwrap();
        assert!(matches!(response, BuildResponse::Completed(_)));

        assert_eq!(diagnostics.0.bad_connections.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.0.completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn accept_errors_are_logged_and_retried() {
        let (tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher =
            ServerDispatcher::with_diagnostics(listener, TestCompilers::instant(), diagnostics.clone());
        let server = tokio::spawn(dispatcher.run(None, CancellationToken::new()));

        tx.send(Err(io::Error::other("transient accept failure")))
            .await
            .unwrap();
        let response = exchange(&tx, vec![Argument::shutdown()]).await;
        assert!(matches!(response, BuildResponse::Shutdown { .. }));

        server.await.unwrap();
        assert_eq!(diagnostics.0.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drains_inflight_connections() {
        let (tx, listener) = ChannelListener::new();
        let diagnostics = RecordingDiagnostics::default();
        let dispatcher = ServerDispatcher::with_diagnostics(
            listener,
            TestCompilers::slow(Duration::from_secs(60)),
            diagnostics.clone(),
        );
        let cancel = CancellationToken::new();
        let server = tokio::spawn(dispatcher.run(Some(Duration::from_secs(1000)), cancel.clone()));

        let mut client = connect(&tx).await;
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![],
        };
        wire::write_request(&mut client, &request).await.unwrap();

        // Cancel only once the dispatcher has accepted the connection, so
        // the compilation is genuinely in flight.
        while diagnostics.0.received.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Shut the server down while the compilation is in flight; the
        // connection is still allowed to finish and deliver its response.
        cancel.cancel();
        let response = wire::read_response(&mut client).await.unwrap();
        assert!(matches!(response, BuildResponse::Completed(_)));

        server.await.unwrap();
        assert_eq!(diagnostics.0.completed.load(Ordering::SeqCst), 1);
    }
}
