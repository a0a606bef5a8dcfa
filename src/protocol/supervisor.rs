//! Session supervision
//!
//! A supervisor owns the logical connection to one DAC. The sender thread
//! runs the current connection until it becomes unusable, then reconnects
//! and keeps reconnecting for as long as the supervisor lives - networks
//! come back. Frame producers talk to the supervisor, never to a
//! connection, so a reconnect is invisible to them.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::constants::{COMM_TIMEOUT, CONTROL_PORT};
use crate::discovery::DiscoveredDac;
use crate::error::ProtocolError;
use crate::protocol::connection::{DacConnection, Shared};
use crate::protocol::point::PointBlock;

/// Owns the connection to one DAC and the sender thread driving it.
///
/// `shutdown` is terminal: afterwards `add_frame` and `wait_for_ready`
/// return [`ProtocolError::ShutDown`].
pub struct DacSupervisor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DacSupervisor {
    /// Connect to `dac` and start streaming. The first connection is made
    /// synchronously so a dead DAC is reported to the caller; later
    /// failures are retried forever by the sender thread.
    pub fn connect(dac: &DiscoveredDac) -> Result<Self, ProtocolError> {
        Self::connect_with_port(dac, CONTROL_PORT)
    }

    pub(crate) fn connect_with_port(dac: &DiscoveredDac, port: u16) -> Result<Self, ProtocolError> {
        let shared = Arc::new(Shared::new());
        let first = DacConnection::connect(dac, port, Arc::clone(&shared))?;

        let dac = dac.clone();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("dac-sender-{}", dac.id))
            .spawn(move || run_supervisor(first, dac, port, thread_shared))
            .map_err(ProtocolError::Io)?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a point block. Beyond two already-queued frames the block is
    /// dropped (logged) instead of blocking the producer.
    pub fn add_frame(&self, block: PointBlock) -> Result<(), ProtocolError> {
        self.shared.add_frame(block)
    }

    /// True while the frame queue can absorb another block without risk of
    /// dropping.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Block until the frame queue has drained to at most one entry.
    pub fn wait_for_ready(&self) -> Result<(), ProtocolError> {
        self.shared.wait_for_ready()
    }

    /// Stop streaming and join the sender thread. Terminal.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DacSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_supervisor(first: DacConnection, dac: DiscoveredDac, port: u16, shared: Arc<Shared>) {
    let mut current = first;

    loop {
        match current.run_sender() {
            Ok(()) => {}
            Err(e) => tracing::warn!("Connection to DAC {} lost: {}", dac.id, e),
        }

        if shared.is_shutdown() {
            return;
        }

        current = loop {
            if shared.is_shutdown() {
                return;
            }
            match DacConnection::connect(&dac, port, Arc::clone(&shared)) {
                Ok(connection) => break connection,
                Err(e) => {
                    tracing::warn!("Reconnect to DAC {} failed: {}", dac.id, e);
                    thread::sleep(COMM_TIMEOUT);
                }
            }
        };
    }
}
