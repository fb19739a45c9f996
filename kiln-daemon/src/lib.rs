// SPDX-License-Identifier: MIT

//! Warm build server daemon.
//!
//! Repeated compiler invocations reuse one warm process instead of paying
//! process-startup cost on every build. A thin client connects to the
//! daemon's unix socket, sends one compilation request, and receives one
//! response; the [`dispatch::ServerDispatcher`] coordinates all connections,
//! shrinks to idle, and shuts the process down when it is no longer wanted.

pub mod compiler;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod listener;

mod gc;
