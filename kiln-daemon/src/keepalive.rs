// SPDX-License-Identifier: MIT

//! Keep-alive tracking.
//!
//! The server stays alive for a configurable duration after its last
//! connection finishes. Clients may extend that duration but can never
//! shorten it: the first explicit override replaces the configured default,
//! and later overrides only win if strictly larger.

use std::time::Duration;

/// The current keep-alive value together with whether it is still the
/// configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    value: Option<Duration>,
    is_default: bool,
}

impl KeepAlive {
    /// Seed the tracker with the configured value. `None` means the idle
    /// timeout is disabled until a client requests one.
    pub fn new(value: Option<Duration>) -> Self {
        Self {
            value,
            is_default: true,
        }
    }

    pub fn value(&self) -> Option<Duration> {
        self.value
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Apply a client-requested keep-alive. Returns whether the effective
    /// value changed.
    pub fn update(&mut self, requested: Duration) -> bool {
        let replace = self.is_default || self.value.is_none_or(|current| requested > current);
        if replace {
            self.value = Some(requested);
            self.is_default = false;
        }
        replace
    }
}
