//! Process termination hook.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::node::Node;

/// Watch for SIGINT/SIGTERM and shut the node down for good.
///
/// The shutdown runs on its own task, so aborting the hook (which the
/// shutdown sequence itself does) cannot cut it short.
pub(crate) fn install(node: &Node) -> JoinHandle<()> {
    let node = node.clone();
    tokio::spawn(async move {
        let signal = match termination_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                warn!(node_id = node.id(), error = %e, "could not install termination handler");
                return;
            }
        };

        let state = node.state();
        if !state.is_active() || state.is_completely_shutdown() {
            return;
        }
        info!(node_id = node.id(), signal, "termination signal received");
        state.mark_completely_shutdown();

        if node.config().properties.shutdown_hook_enabled {
            let shutdown = node.shutdown_coordinator().shutdown_in_background(true);
            let _ = shutdown.await;
        }
        node.notify_terminated();
    })
}

/// Resolve with the signal name once SIGINT or SIGTERM arrives.
#[cfg(unix)]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
