use std::io;
use std::thread;

use crossbeam_channel::bounded;

use crate::worker::StatusHandle;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Each signal cancels the task worker behind `handle`; the worker's own
/// run then performs the shutdown. Returns once the handlers are registered.
pub fn install_shutdown_handler(handle: StatusHandle) -> io::Result<()> {
    let (ready_tx, ready_rx) = bounded::<io::Result<()>>(1);

    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            rt.block_on(listen(handle, ready_tx));
        })?;

    ready_rx
        .recv()
        .map_err(|_| io::Error::other("signal listener exited during setup"))?
}

#[cfg(unix)]
async fn listen(handle: StatusHandle, ready: crossbeam_channel::Sender<io::Result<()>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let registered = signal(SignalKind::terminate())
        .and_then(|sigterm| signal(SignalKind::interrupt()).map(|sigint| (sigterm, sigint)));
    let (mut sigterm, mut sigint) = match registered {
        Ok(signals) => {
            let _ = ready.send(Ok(()));
            signals
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("[SHUTDOWN] Received SIGTERM, cancelling task worker");
            }
            _ = sigint.recv() => {
                log::info!("[SHUTDOWN] Received SIGINT, cancelling task worker");
            }
        }
        handle.cancel();
    }
}

#[cfg(not(unix))]
async fn listen(handle: StatusHandle, ready: crossbeam_channel::Sender<io::Result<()>>) {
    let _ = ready.send(Ok(()));
    while tokio::signal::ctrl_c().await.is_ok() {
        log::info!("[SHUTDOWN] Received Ctrl-C, cancelling task worker");
        handle.cancel();
    }
}
