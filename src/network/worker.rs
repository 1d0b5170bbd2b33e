//! Event-loop workers
//!
//! Each worker owns a `mio::Poll` and every channel assigned to it.
//! Callers reach a worker through its mailbox plus a `mio::Waker`; all
//! socket I/O, stage changes and consumer calls happen on the worker thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::address::BusAddress;
use super::auth::Authenticator;
use super::channel::{Channel, ReadStatus};
use super::completion::Completer;
use super::connection::{Connection, ConnectionState, StateCell};
use super::dispatch::{MessageStage, SwappableConsumer};
use super::pipeline::{Pipeline, StageContext, StageEvent, WireTap};
use crate::error::{Error, Result};
use crate::protocol::message::SignatureCache;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

pub(crate) enum Command {
    Attach(Box<Attach>),
    Send { id: usize, bytes: Vec<u8> },
    Close { id: usize },
    Shutdown,
}

/// A freshly connected channel plus what the worker needs to finish the
/// bootstrap.
pub(crate) struct Attach {
    pub id: usize,
    pub channel: Channel,
    pub address: BusAddress,
    pub state: StateCell,
    pub completer: Completer,
    pub consumer: SwappableConsumer,
    pub signatures: Arc<SignatureCache>,
    pub pool: Arc<WorkerPool>,
    pub uid: u32,
    pub auth_timeout: Duration,
    pub max_message_size: usize,
    pub log_wire_bytes: bool,
}

#[derive(Default)]
struct Mailbox {
    commands: VecDeque<Command>,
    closed: bool,
}

struct WorkerShared {
    mailbox: Mutex<Mailbox>,
    waker: Waker,
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    index: usize,
}

impl WorkerHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queue `command` and wake the worker. Fails once the worker stopped.
    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        {
            let mut mailbox = self.shared.mailbox.lock();
            if mailbox.closed {
                return Err(Error::ConnectionClosed);
            }
            mailbox.commands.push_back(command);
        }
        self.shared.waker.wake()?;
        Ok(())
    }
}

/// Round-robin set of worker threads. Dropping it stops them all.
pub(crate) struct WorkerPool {
    handles: Vec<WorkerHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn start(count: usize) -> io::Result<Self> {
        let count = count.max(1);
        let mut pool = WorkerPool {
            handles: Vec::with_capacity(count),
            threads: Mutex::new(Vec::with_capacity(count)),
            next: AtomicUsize::new(0),
        };
        for index in 0..count {
            let worker = Worker::new(index)?;
            pool.handles.push(worker.handle());
            let thread = thread::Builder::new()
                .name(format!("dbuslink-worker-{index}"))
                .spawn(move || worker.run())?;
            pool.threads.lock().push(thread);
        }
        debug!(workers = count, "worker pool started");
        Ok(pool)
    }

    pub(crate) fn next_worker(&self) -> WorkerHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    fn shutdown(&self) {
        for handle in &self.handles {
            let _ = handle.submit(Command::Shutdown);
        }
        // The last reference may go away on a worker thread; never join self.
        let current = thread::current().id();
        for t in self.threads.lock().drain(..) {
            if t.thread().id() != current {
                let _ = t.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Why a channel is being torn down.
#[derive(Debug)]
enum Termination {
    Closed,
    Eof,
    Io(io::Error),
    AuthFailed(String),
    AuthTimeout,
    Fatal(String),
}

impl Termination {
    fn into_error(self) -> Error {
        match self {
            Termination::Closed => Error::ConnectionClosed,
            Termination::Eof => {
                Error::AuthenticationFailed("peer closed the connection during handshake".into())
            }
            Termination::Io(e) => Error::Io(e),
            Termination::AuthFailed(reason) | Termination::Fatal(reason) => {
                Error::AuthenticationFailed(reason)
            }
            Termination::AuthTimeout => Error::AuthTimeout,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Closed => f.write_str("closed locally"),
            Termination::Eof => f.write_str("peer closed"),
            Termination::Io(e) => write!(f, "I/O error: {e}"),
            Termination::AuthFailed(r) => write!(f, "authentication failed: {r}"),
            Termination::AuthTimeout => f.write_str("authentication timed out"),
            Termination::Fatal(r) => write!(f, "protocol error: {r}"),
        }
    }
}

/// Held until the handshake completes, then turned into a [`Connection`].
struct Handover {
    address: BusAddress,
    consumer: SwappableConsumer,
    signatures: Arc<SignatureCache>,
    pool: Arc<WorkerPool>,
    max_message_size: usize,
}

enum Phase {
    Authenticating {
        completer: Completer,
        deadline: Instant,
        handover: Handover,
    },
    Active,
}

struct Entry {
    id: usize,
    channel: Channel,
    pipeline: Pipeline,
    ctx: StageContext,
    state: StateCell,
    phase: Phase,
}

impl Entry {
    /// Read until the socket runs dry, feeding the pipeline as bytes arrive.
    fn pump(&mut self, worker: &WorkerHandle) -> std::result::Result<(), Termination> {
        while self.channel.auto_read() {
            match self.channel.fill_read_buffer().map_err(Termination::Io)? {
                ReadStatus::Data(n) => {
                    self.pipeline.bytes_read(self.channel.last_read(n));
                    self.deliver(worker)?;
                }
                ReadStatus::WouldBlock => break,
                ReadStatus::Eof => return Err(Termination::Eof),
            }
        }
        Ok(())
    }

    fn deliver(&mut self, worker: &WorkerHandle) -> std::result::Result<(), Termination> {
        loop {
            let consumed = self.pipeline.dispatch(self.channel.readable(), &mut self.ctx);
            self.channel.consume(consumed);
            self.flush_outbound()?;

            let events = self.ctx.take_events();
            let progressed = consumed > 0 || !events.is_empty();
            for event in events {
                match event {
                    StageEvent::AuthComplete { guid } => self.activate(guid, worker),
                    StageEvent::AuthFailed(reason) => return Err(Termination::AuthFailed(reason)),
                    StageEvent::Fatal(reason) => return Err(Termination::Fatal(reason)),
                }
            }
            if !progressed || self.ctx.is_halted() {
                return Ok(());
            }
        }
    }

    fn flush_outbound(&mut self) -> std::result::Result<(), Termination> {
        let out = self.ctx.take_outbound();
        if !out.is_empty() {
            self.pipeline.bytes_written(&out);
            self.channel.queue_write(&out);
        }
        self.channel.flush_write_buffer().map_err(Termination::Io)?;
        Ok(())
    }

    /// Swap the authenticator for the message stage and complete the connect.
    /// The stage change happens before delivery resumes, so bytes behind the
    /// `OK` line only ever reach the message stage.
    fn activate(&mut self, guid: String, worker: &WorkerHandle) {
        let Phase::Authenticating {
            completer,
            handover,
            ..
        } = std::mem::replace(&mut self.phase, Phase::Active)
        else {
            return;
        };

        self.pipeline.remove(Authenticator::NAME);
        self.pipeline.add_last(
            Box::new(MessageStage::new(
                self.id,
                handover.consumer.clone(),
                handover.signatures,
                handover.max_message_size,
            )),
            &mut self.ctx,
        );
        self.ctx.resume();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Authenticating {
                *state = ConnectionState::Active;
            }
        }
        info!(
            connection = self.id,
            address = %handover.address,
            %guid,
            "connection active"
        );

        let connection = Connection::new(
            self.id,
            guid,
            handover.address,
            Arc::clone(&self.state),
            handover.consumer,
            worker.clone(),
            handover.pool,
        );
        completer.complete(Ok(connection));
    }
}

pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    shared: Arc<WorkerShared>,
    entries: HashMap<Token, Entry>,
}

impl Worker {
    fn new(index: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            index,
            poll,
            shared: Arc::new(WorkerShared {
                mailbox: Mutex::new(Mailbox::default()),
                waker,
            }),
            entries: HashMap::new(),
        })
    }

    fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
            index: self.index,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!(worker = self.index, "worker started");

        loop {
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(worker = self.index, error = %e, "poll failed, stopping worker");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if event.is_writable() {
                    self.on_writable(token);
                }
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.on_readable(token);
                }
            }

            if !self.drain_commands() {
                break;
            }
            self.expire_handshakes();
        }

        self.stop();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| match e.phase {
                Phase::Authenticating { deadline, .. } => Some(deadline),
                Phase::Active => None,
            })
            .min()
    }

    fn on_readable(&mut self, token: Token) {
        let handle = self.handle();
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        if let Err(t) = entry.pump(&handle) {
            self.terminate(token, t);
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        if let Err(e) = entry.channel.flush_write_buffer() {
            self.terminate(token, Termination::Io(e));
        }
    }

    /// Returns false on shutdown.
    fn drain_commands(&mut self) -> bool {
        let commands: Vec<Command> = self.shared.mailbox.lock().commands.drain(..).collect();
        for command in commands {
            match command {
                Command::Attach(attach) => self.attach(*attach),
                Command::Send { id, bytes } => self.send(Token(id), bytes),
                Command::Close { id } => self.terminate(Token(id), Termination::Closed),
                Command::Shutdown => return false,
            }
        }
        true
    }

    fn attach(&mut self, attach: Attach) {
        let token = Token(attach.id);
        let Attach {
            id,
            channel,
            address,
            state,
            completer,
            consumer,
            signatures,
            pool,
            uid,
            auth_timeout,
            max_message_size,
            log_wire_bytes,
        } = attach;

        *state.lock() = ConnectionState::Authenticating;
        let mut entry = Entry {
            id,
            channel,
            pipeline: Pipeline::new(),
            ctx: StageContext::new(),
            state,
            phase: Phase::Authenticating {
                completer,
                deadline: Instant::now() + auth_timeout,
                handover: Handover {
                    address,
                    consumer,
                    signatures,
                    pool,
                    max_message_size,
                },
            },
        };

        if log_wire_bytes {
            entry.pipeline.add_last(Box::new(WireTap::new(id)), &mut entry.ctx);
        }
        entry
            .pipeline
            .add_last(Box::new(Authenticator::new(uid)), &mut entry.ctx);

        if let Err(e) = self.poll.registry().register(
            entry.channel.transport_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.finish(entry, Termination::Io(e));
            return;
        }
        entry.channel.set_auto_read(entry.pipeline.accepts_input());
        debug!(
            worker = self.index,
            connection = id,
            stages = ?entry.pipeline.names(),
            "channel attached"
        );

        let handle = self.handle();
        match entry.flush_outbound().and_then(|_| entry.pump(&handle)) {
            Ok(()) => {
                self.entries.insert(token, entry);
            }
            Err(t) => self.finish(entry, t),
        }
    }

    fn send(&mut self, token: Token, bytes: Vec<u8>) {
        let Some(entry) = self.entries.get_mut(&token) else {
            debug!(worker = self.index, connection = token.0, "send to unknown connection dropped");
            return;
        };
        if !matches!(entry.phase, Phase::Active) {
            warn!(connection = entry.id, "send before handshake completed dropped");
            return;
        }
        entry.pipeline.bytes_written(&bytes);
        entry.channel.queue_write(&bytes);
        if let Err(e) = entry.channel.flush_write_buffer() {
            self.terminate(token, Termination::Io(e));
        }
    }

    fn expire_handshakes(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(e.phase, Phase::Authenticating { deadline, .. } if deadline <= now)
            })
            .map(|(t, _)| *t)
            .collect();
        for token in expired {
            self.terminate(token, Termination::AuthTimeout);
        }
    }

    fn terminate(&mut self, token: Token, reason: Termination) {
        if let Some(entry) = self.entries.remove(&token) {
            self.finish(entry, reason);
        }
    }

    fn finish(&mut self, mut entry: Entry, reason: Termination) {
        let _ = self.poll.registry().deregister(entry.channel.transport_mut());
        let _ = entry.channel.flush_write_buffer();
        if entry.channel.write_pending() > 0 {
            debug!(
                connection = entry.id,
                pending = entry.channel.write_pending(),
                "unsent bytes discarded"
            );
        }
        entry.channel.shutdown();

        match std::mem::replace(&mut entry.phase, Phase::Active) {
            Phase::Authenticating {
                completer,
                handover,
                ..
            } => {
                *entry.state.lock() = ConnectionState::Failed;
                let error = reason.into_error();
                warn!(
                    connection = entry.id,
                    address = %handover.address,
                    error = %error,
                    "handshake failed"
                );
                completer.complete(Err(error));
            }
            Phase::Active => {
                {
                    let mut state = entry.state.lock();
                    if !state.is_terminal() {
                        *state = ConnectionState::Closed;
                    }
                }
                info!(connection = entry.id, reason = %reason, "connection closed");
            }
        }
    }

    fn stop(&mut self) {
        let pending: Vec<Command> = {
            let mut mailbox = self.shared.mailbox.lock();
            mailbox.closed = true;
            mailbox.commands.drain(..).collect()
        };
        drop(pending);

        let entries: Vec<Entry> = self.entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.finish(entry, Termination::Closed);
        }
        debug!(worker = self.index, "worker stopped");
    }
}
