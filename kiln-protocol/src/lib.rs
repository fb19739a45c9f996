// SPDX-License-Identifier: MIT

//! Wire protocol for the kiln build server.
//!
//! This crate defines the messages exchanged between a build client and the
//! kiln daemon, together with their framing over a byte stream. A client
//! connection carries exactly one request and at most one response.
//!
//! # Wire format
//!
//! Every message is a frame: a little-endian `u32` payload length followed
//! by the payload. Strings are a `u32` length followed by UTF-8 bytes. The
//! request payload starts with a `u32` protocol version so incompatible
//! clients are rejected before any field is interpreted.

pub mod error;
pub mod types;
pub mod wire;

pub use error::{IoContext, ProtocolError};
pub use types::{Argument, ArgumentKind, BuildResponse, CompletedResponse, RunRequest};
pub use wire::{
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, read_request, read_response, write_request,
    write_response,
};
