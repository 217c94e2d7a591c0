// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection

use tokio::signal::ctrl_c;

/// Future that resolves when the process has been asked to stop.
///
/// Detects a `SIGINT` or, on Unix, a `SIGTERM`.
///
/// **BEWARE:** This alters process state by _permanently_ registering an interrupt handler
/// through [`tokio`]. As such, this should only be called near the entry point to a program,
/// not by a library. Signals may only be detected after this is first called, and multiple
/// signals may be collapsed.
///
/// # Panics
///
/// If [`tokio::signal`] can't register its handlers, which only happens when lower-level
/// things fail.
pub async fn shutdown_requested() {
    let interrupted = async {
        ctrl_c().await.expect("Unable to await CTRL-C");
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Can't register SIGTERM handler");
        tokio::select! {
            _ = interrupted => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    interrupted.await;
}

// Registering a signal handler is permanent and global, so this isn't unit tested; it's
// exercised by running the binary and sending it signals.
