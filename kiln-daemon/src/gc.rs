// SPDX-License-Identifier: MIT

//! Best-effort memory reclaim once the server goes idle.
//!
//! Rust has no collector to invoke, so the idle "GC pass" asks the
//! allocator to return freed pages to the OS where the platform supports
//! it. Purely a hygiene measure; failure is not observable and does not
//! matter.

use tracing::debug;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub(crate) fn reclaim_memory() {
    // malloc_trim only reads allocator metadata and releases free pages.
    let released = unsafe { libc::malloc_trim(0) };
    debug!(released, "Idle memory reclaim pass finished");
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn reclaim_memory() {
    debug!("Idle memory reclaim pass is a no-op on this platform");
}
