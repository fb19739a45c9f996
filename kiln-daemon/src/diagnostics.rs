// SPDX-License-Identifier: MIT

//! Observability hooks for the dispatcher.
//!
//! Pure fire-and-forget notifications; nothing here influences control
//! flow. The unit type is the null listener.

use std::time::Duration;

use crate::dispatch::CompletionReason;

pub trait DiagnosticListener: Send + Sync + 'static {
    /// A new client connection was accepted.
    fn connection_received(&self) {}

    /// A connection finished; `completed_count` is the total processed so
    /// far.
    fn connection_completed(&self, _completed_count: usize) {}

    /// A client override changed the effective keep-alive.
    fn update_keep_alive(&self, _keep_alive: Duration) {}

    /// The idle timeout elapsed with no connections in flight.
    fn keep_alive_reached(&self) {}

    /// A connection ended in a way that makes the server distrust its
    /// clients (disconnect mid-request or an internal failure).
    fn detected_bad_connection(&self, _reason: CompletionReason) {}
}

impl DiagnosticListener for () {}
