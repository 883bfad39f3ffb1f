use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{Connection, ConnectionError};

/// In-process connection backed by two unbounded channels.
///
/// Dropping one end makes the other end's `receive` and `send` fail with
/// `ConnectionError::Closed`, which is how tests simulate a lost server.
pub struct MemoryConnection {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl MemoryConnection {
    /// Two connected ends: whatever one sends, the other receives.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            MemoryConnection { tx: a_tx, rx: b_rx },
            MemoryConnection { tx: b_tx, rx: a_rx },
        )
    }
}

impl Connection for MemoryConnection {
    fn receive(&self, timeout: Duration) -> Result<String, ConnectionError> {
        match self.rx.recv_timeout(timeout) {
            Ok(text) => Ok(text),
            Err(RecvTimeoutError::Timeout) => Err(ConnectionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
        }
    }

    fn send(&self, text: &str) -> Result<(), ConnectionError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| ConnectionError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_both_ways() {
        let (server, worker) = MemoryConnection::pair();
        server.send("hello").unwrap();
        worker.send("world").unwrap();
        assert_eq!(worker.receive(Duration::from_millis(100)).unwrap(), "hello");
        assert_eq!(server.receive(Duration::from_millis(100)).unwrap(), "world");
    }

    #[test]
    fn test_receive_times_out_when_idle() {
        let (_server, worker) = MemoryConnection::pair();
        assert!(matches!(
            worker.receive(Duration::from_millis(10)),
            Err(ConnectionError::Timeout)
        ));
    }

    #[test]
    fn test_dropped_peer_closes() {
        let (server, worker) = MemoryConnection::pair();
        drop(server);
        assert!(matches!(
            worker.receive(Duration::from_millis(10)),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(worker.send("x"), Err(ConnectionError::Closed)));
    }
}
