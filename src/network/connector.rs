//! Connection bootstrap
//!
//! Resolving and connecting run on the caller thread; the connected channel
//! is then handed to a worker which drives the handshake and completes the
//! returned [`PendingConnection`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::address::{parse_addresses, BusAddress};
use super::channel::Channel;
use super::completion::{completion, PendingConnection};
use super::connection::{ConnectionState, StateCell};
use super::dispatch::{Discard, MessageConsumer, SwappableConsumer};
use super::transport::Transport;
use super::worker::{Attach, Command, WorkerPool};
use crate::config::{self, ConnectorConfig};
use crate::error::{Error, Result};
use crate::protocol::message::SignatureCache;

pub struct Connector {
    config: ConnectorConfig,
    pool: Arc<WorkerPool>,
    initial_consumer: Arc<dyn MessageConsumer>,
    signatures: Arc<SignatureCache>,
    next_id: AtomicUsize,
}

impl Connector {
    /// Connector with [`ConnectorConfig::default`].
    pub fn new() -> Result<Self> {
        Self::with_config(ConnectorConfig::default())
    }

    pub fn with_config(config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::start(config.workers)?;
        Ok(Self {
            config,
            pool: Arc::new(pool),
            initial_consumer: Arc::new(Discard),
            signatures: Arc::new(SignatureCache::new()),
            // Token(0) is the worker's waker.
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Consumer installed on connections opened from now on.
    pub fn set_initial_consumer(&mut self, consumer: Arc<dyn MessageConsumer>) {
        self.initial_consumer = consumer;
    }

    /// Connect to the first reachable entry of a `;`-separated address list.
    pub fn connect(&self, address: &str) -> Result<PendingConnection> {
        let candidates = parse_addresses(address)?;
        let mut last_error = None;
        for candidate in &candidates {
            match self.connect_address(candidate) {
                Ok(pending) => return Ok(pending),
                Err(e) => {
                    warn!(address = %candidate, error = %e, "address unreachable");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::ConnectionClosed))
    }

    pub fn connect_address(&self, address: &BusAddress) -> Result<PendingConnection> {
        let uid = current_uid()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state: StateCell = Arc::new(Mutex::new(ConnectionState::Resolving));
        info!(connection = id, %address, "connecting to bus");

        *state.lock() = ConnectionState::Connecting;
        let transport = match Transport::connect(address, self.config.socket_buffer_size) {
            Ok(t) => t,
            Err(e) => {
                *state.lock() = ConnectionState::Failed;
                return Err(e.into());
            }
        };
        let channel = Channel::new(
            transport,
            self.config.read_buffer_size,
            self.config.max_message_size,
        );

        let (completer, pending) = completion();
        let worker = self.pool.next_worker();
        debug!(
            connection = id,
            worker = worker.index(),
            workers = self.pool.len(),
            "handing channel to worker"
        );
        worker.submit(Command::Attach(Box::new(Attach {
            id,
            channel,
            address: address.clone(),
            state,
            completer,
            consumer: SwappableConsumer::new(Arc::clone(&self.initial_consumer)),
            signatures: Arc::clone(&self.signatures),
            pool: Arc::clone(&self.pool),
            uid,
            auth_timeout: self.config.auth_timeout,
            max_message_size: self.config.max_message_size,
            log_wire_bytes: self.config.log_wire_bytes,
        })))?;
        Ok(pending)
    }

    /// Connect to the session bus of the current user.
    pub fn connect_session(&self) -> Result<PendingConnection> {
        self.connect(&config::session_bus_address()?)
    }

    /// Connect to the system bus.
    pub fn connect_system(&self) -> Result<PendingConnection> {
        self.connect(&config::system_bus_address())
    }
}

#[cfg(unix)]
fn current_uid() -> Result<u32> {
    // SAFETY: getuid has no preconditions and cannot fail.
    Ok(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn current_uid() -> Result<u32> {
    Err(Error::AuthenticationFailed(
        "EXTERNAL authentication needs a unix uid".into(),
    ))
}
