//! Worker side of a compute node.
//!
//! Holds one connection to the coordinating server, hands each task to an
//! inference or download task process, and streams the results back.

pub mod connection;
pub mod logging;
pub mod node;
pub mod runner;
pub mod shutdown;
pub mod worker;

pub use node::{handshake, run_node, HandshakeError, VERSION};
pub use worker::{OrchestratorError, StatusHandle, TaskWorker, WorkerStatus};
