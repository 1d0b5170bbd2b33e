//! Public connection handle
//!
//! Cheap to clone. The socket itself belongs to a worker; the handle only
//! queues commands for it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::address::BusAddress;
use super::dispatch::{MessageConsumer, SwappableConsumer};
use super::worker::{Command, WorkerHandle, WorkerPool};
use crate::error::{Error, Result};
use crate::protocol::message::Message;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Connecting,
    Authenticating,
    Active,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// State shared between the handle and the worker.
pub(crate) type StateCell = Arc<Mutex<ConnectionState>>;

pub(crate) struct ConnectionShared {
    pub(crate) id: usize,
    pub(crate) guid: String,
    pub(crate) address: BusAddress,
    pub(crate) state: StateCell,
    pub(crate) consumer: SwappableConsumer,
    pub(crate) worker: WorkerHandle,
    next_serial: AtomicU32,
    // Keeps the workers alive while any handle exists.
    _pool: Arc<WorkerPool>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(
        id: usize,
        guid: String,
        address: BusAddress,
        state: StateCell,
        consumer: SwappableConsumer,
        worker: WorkerHandle,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionShared {
                id,
                guid,
                address,
                state,
                consumer,
                worker,
                next_serial: AtomicU32::new(1),
                _pool: pool,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Server GUID from the handshake.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    pub fn address(&self) -> &BusAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Encode `message` under a fresh serial and queue it. Returns the serial.
    pub fn send(&self, message: &Message) -> Result<u32> {
        if self.state().is_terminal() {
            return Err(Error::ConnectionClosed);
        }
        let serial = self.next_serial();
        let bytes = message.encode(serial)?;
        self.inner.worker.submit(Command::Send {
            id: self.inner.id,
            bytes,
        })?;
        Ok(serial)
    }

    /// Replace the consumer; the next decoded message goes to `consumer`.
    pub fn set_consumer(&self, consumer: Arc<dyn MessageConsumer>) {
        if self.state().is_terminal() {
            warn!(connection = self.inner.id, "consumer replaced on a closed connection");
        }
        self.inner.consumer.swap(consumer);
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        self.inner.close("close requested");
    }
}

impl ConnectionShared {
    fn close(&self, reason: &'static str) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ConnectionState::Closed;
        }
        debug!(connection = self.id, "{}", reason);
        // A stopped worker has already dropped the socket.
        let _ = self.worker.submit(Command::Close { id: self.id });
    }
}

/// The last handle going away closes the socket.
impl Drop for ConnectionShared {
    fn drop(&mut self) {
        self.close("last handle dropped");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("guid", &self.inner.guid)
            .field("state", &self.state())
            .finish()
    }
}
