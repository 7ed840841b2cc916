//! Process termination for the relay node.
//!
//! Components subscribe once at wiring time and stop when the first notification arrives.

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tracing::{debug, error, info};

/// Fans out a single stop notification to the app server and the RPC server
pub struct Shutdown {
    tx_shutdown: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        let (tx_shutdown, _) = broadcast::channel(1);
        Self { tx_shutdown }
    }
}

impl Shutdown {
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx_shutdown.subscribe()
    }

    /// Tell every live subscriber to stop, returning how many were reached
    pub fn notify(&self) -> usize {
        self.tx_shutdown.send(()).unwrap_or_default()
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers.
    ///
    /// Components that already exited are not an error: the node is stopping anyway.
    pub async fn run(&self) -> Result<(), ()> {
        let signal_name = match wait_for_signal().await {
            Ok(signal_name) => signal_name,
            Err(err) => {
                error!("Failed to install signal handlers: {}", err);
                return Err(());
            }
        };
        info!("Received {}, stopping the relay node...", signal_name);

        let reached = self.notify();
        debug!("Shutdown delivered to {} components", reached);
        Ok(())
    }
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signal_name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal_name)
}
