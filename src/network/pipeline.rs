//! Inbound pipeline
//!
//! An ordered list of named stages. Input is offered to each stage in turn;
//! the first stage that consumes bytes ends the pass. A stage can halt
//! delivery so the worker can rearrange the pipeline before any further
//! byte is processed.

use tracing::{debug, trace};

/// What a stage did with the bytes offered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Took this many bytes from the front; zero means "wait for more".
    Consumed(usize),
    /// Not for this stage; offer to the next one.
    Pass,
}

/// Signals a stage raises for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    AuthComplete { guid: String },
    AuthFailed(String),
    /// Unrecoverable framing error; the channel must close.
    Fatal(String),
}

/// Side effects collected while stages run.
#[derive(Debug, Default)]
pub struct StageContext {
    outbound: Vec<u8>,
    events: Vec<StageEvent>,
    halted: bool,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    pub fn emit(&mut self, event: StageEvent) {
        self.events.push(event);
    }

    /// Stop delivering input until the worker resumes it.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    #[inline(always)]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_events(&mut self) -> Vec<StageEvent> {
        std::mem::take(&mut self.events)
    }
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Called once when the stage joins a pipeline.
    fn on_attach(&mut self, _ctx: &mut StageContext) {}

    /// Observe freshly read bytes before any stage consumes them.
    fn on_bytes_read(&mut self, _bytes: &[u8]) {}

    /// Observe bytes about to go out.
    fn on_bytes_written(&mut self, _bytes: &[u8]) {}

    fn handle_inbound(&mut self, input: &[u8], ctx: &mut StageContext) -> Inbound;
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_last(&mut self, mut stage: Box<dyn Stage>, ctx: &mut StageContext) {
        debug!(stage = stage.name(), "stage installed");
        stage.on_attach(ctx);
        self.stages.push(stage);
    }

    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Stage>> {
        let idx = self.stages.iter().position(|s| s.name() == name)?;
        debug!(stage = name, "stage removed");
        Some(self.stages.remove(idx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// True when some stage besides taps can take input.
    pub fn accepts_input(&self) -> bool {
        self.stages.iter().any(|s| s.name() != WireTap::NAME)
    }

    pub fn bytes_read(&mut self, bytes: &[u8]) {
        for stage in &mut self.stages {
            stage.on_bytes_read(bytes);
        }
    }

    pub fn bytes_written(&mut self, bytes: &[u8]) {
        for stage in &mut self.stages {
            stage.on_bytes_written(bytes);
        }
    }

    /// Offer `input` to the stages in order; returns bytes consumed.
    pub fn dispatch(&mut self, input: &[u8], ctx: &mut StageContext) -> usize {
        if ctx.is_halted() || input.is_empty() {
            return 0;
        }
        for stage in &mut self.stages {
            match stage.handle_inbound(input, ctx) {
                Inbound::Consumed(n) => return n.min(input.len()),
                Inbound::Pass => continue,
            }
        }
        0
    }
}

/// Traces raw wire bytes in both directions.
pub struct WireTap {
    connection: usize,
}

impl WireTap {
    pub const NAME: &'static str = "wire-tap";

    pub fn new(connection: usize) -> Self {
        Self { connection }
    }
}

impl Stage for WireTap {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_bytes_read(&mut self, bytes: &[u8]) {
        trace!(
            connection = self.connection,
            len = bytes.len(),
            bytes = %hex::encode(bytes),
            "<< read"
        );
    }

    fn on_bytes_written(&mut self, bytes: &[u8]) {
        trace!(
            connection = self.connection,
            len = bytes.len(),
            bytes = %hex::encode(bytes),
            ">> write"
        );
    }

    fn handle_inbound(&mut self, _input: &[u8], _ctx: &mut StageContext) -> Inbound {
        Inbound::Pass
    }
}
