//! The self-update seam.
//!
//! The server announces its known edge version after every connect; when
//! that version is strictly newer than this build, the runtime invokes the
//! updater. How the binary gets replaced is a deployment concern — the
//! default implementation simply exits cleanly so the process supervisor
//! restarts whatever is installed by then.

use tracing::info;

/// Replaces the running edge software.
pub trait Updater: Send + Sync {
    fn update(&self);
}

/// Exits with code 0 and leaves the restart to the process supervisor.
pub struct RestartUpdater;

impl Updater for RestartUpdater {
    fn update(&self) {
        info!("a newer edge version is available; exiting for the supervisor to restart");
        std::process::exit(0);
    }
}
