//! WebSocket transport.
//!
//! tokio-tungstenite is async while the orchestrator loops are plain
//! threads, so a dedicated thread owns a current-thread runtime and the
//! socket, and bridges frames through channels:
//! - inbound text frames → crossbeam channel (timed `receive`)
//! - `send` → tokio mpsc → socket, acknowledged back so write errors surface

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use super::{Connection, ConnectionError};

type Inbound = Result<String, ConnectionError>;

enum Outbound {
    Text {
        text: String,
        ack: Sender<Result<(), ConnectionError>>,
    },
    Close,
}

/// Client side of a WebSocket connection to the coordinating server.
pub struct WsConnection {
    inbound: Receiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WsConnection {
    /// Connect to `url` and start the IO thread. Returns once the
    /// WebSocket handshake has completed or failed.
    pub fn connect(url: &str) -> Result<Self, ConnectionError> {
        let (inbound_tx, inbound_rx) = unbounded::<Inbound>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (ready_tx, ready_rx) = bounded::<Result<(), ConnectionError>>(1);
        let url = url.to_string();

        let io_thread = thread::Builder::new()
            .name("ws-io".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ConnectionError::Transport(format!(
                            "Failed to create tokio runtime: {e}"
                        ))));
                        return;
                    }
                };
                rt.block_on(socket_task(url, ready_tx, inbound_tx, outbound_rx));
            })
            .map_err(|e| {
                ConnectionError::Transport(format!("Failed to spawn websocket thread: {e}"))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
                io_thread: Mutex::new(Some(io_thread)),
            }),
            Ok(Err(e)) => {
                let _ = io_thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = io_thread.join();
                Err(ConnectionError::Closed)
            }
        }
    }

    /// Send a close frame and wait for the IO thread to finish.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        if let Ok(mut guard) = self.io_thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connection for WsConnection {
    fn receive(&self, timeout: Duration) -> Result<String, ConnectionError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(ConnectionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
        }
    }

    fn send(&self, text: &str) -> Result<(), ConnectionError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.outbound
            .send(Outbound::Text {
                text: text.to_string(),
                ack: ack_tx,
            })
            .map_err(|_| ConnectionError::Closed)?;
        // Ack sender is dropped unanswered if the socket task has exited.
        ack_rx.recv().map_err(|_| ConnectionError::Closed)?
    }
}

async fn socket_task(
    url: String,
    ready_tx: Sender<Result<(), ConnectionError>>,
    inbound_tx: Sender<Inbound>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            let _ = ready_tx.send(Err(ConnectionError::Transport(format!(
                "Failed to connect to {url}: {e}"
            ))));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    log::info!("[WS] Connected to {url}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound_tx.send(Ok(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    log::info!("[WS] Server closed the connection: {frame:?}");
                    let _ = inbound_tx.send(Err(ConnectionError::Closed));
                    break;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("[WS] Read error: {e}");
                    let _ = inbound_tx.send(Err(ConnectionError::Transport(e.to_string())));
                    break;
                }
                None => {
                    let _ = inbound_tx.send(Err(ConnectionError::Closed));
                    break;
                }
            },
            request = outbound_rx.recv() => match request {
                Some(Outbound::Text { text, ack }) => {
                    let result = ws_sender
                        .send(WsMessage::Text(text))
                        .await
                        .map_err(|e| ConnectionError::Transport(e.to_string()));
                    let _ = ack.send(result);
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }

    log::info!("[WS] Connection task exiting");
}
