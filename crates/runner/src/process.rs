//! Child process shutdown shared by the automation server and the browser

use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Ask a child to exit with SIGTERM, then kill it once `grace` has passed
pub(crate) async fn stop_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    debug!("Stopping child process (pid: {})", pid);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
            && tokio::time::timeout(grace, child.wait()).await.is_ok()
        {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process {}: {}", pid, e);
    }
}
