//! Process lifecycle flags.
//!
//! Two orthogonal states:
//! - `LISTENING`: Is the accept loop running? (decides how Ctrl+C is handled)
//! - `SHUTDOWN`: Has shutdown been requested? (Ctrl+C received)

use std::sync::atomic::{AtomicBool, Ordering};

/// Accept loop is running
/// - `false`: Ctrl+C exits immediately
/// - `true`: Ctrl+C asks the loop to stop and drain sessions
static LISTENING: AtomicBool = AtomicBool::new(false);

/// Shutdown has been requested (Ctrl+C received)
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// =============================================================================
// LISTENING state
// =============================================================================

pub fn is_listening() -> bool {
    LISTENING.load(Ordering::SeqCst)
}

pub fn set_listening(listening: bool) {
    LISTENING.store(listening, Ordering::SeqCst);
}

// =============================================================================
// SHUTDOWN state
// =============================================================================

/// Setup the global Ctrl+C handler. Call once at program start
///
/// - Before the server listens: exit right away, there is nothing to drain
/// - While listening: set the SHUTDOWN flag, the accept loop notices it
pub fn setup_shutdown_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        SHUTDOWN.store(true, Ordering::SeqCst);

        if is_listening() {
            crate::log!("serve"; "shutting down...");
        } else {
            std::process::exit(0);
        }
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}

/// Check if shutdown has been requested
///
/// Relaxed ordering: the worst case is one more poll of the accept loop.
pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

// =============================================================================
// Tests
// =============================================================================
