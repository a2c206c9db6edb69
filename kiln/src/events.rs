//! Typed event stream emitted by the engine.
//!
//! The engine never renders anything itself. Presentation layers attach a
//! receiver and decide what to show; tests collect the events and assert on
//! them.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::core::types::{Checkpoint, FileAction, GateResult, PhaseStatus, VerifyCheck};
use crate::io::process::StreamKind;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PhaseStarted {
        index: usize,
        phase: String,
        iteration: u32,
        /// True when an interrupted attempt is being continued.
        resumed: bool,
    },
    PhaseFinished {
        index: usize,
        phase: String,
        status: PhaseStatus,
    },
    /// One line of worker output, forwarded as it arrives.
    Output {
        phase: String,
        stream: StreamKind,
        line: String,
    },
    Narration {
        phase: String,
        text: String,
    },
    ChunkStarted {
        /// 0-based chunk index.
        index: usize,
        total: usize,
        step_ids: Vec<String>,
    },
    FileApplied {
        path: String,
        action: FileAction,
    },
    GateFinished(GateResult),
    Verification {
        summary: String,
        failures: Vec<VerifyCheck>,
    },
    Checkpoint(Checkpoint),
    LoopBack {
        from: String,
        to: String,
    },
}

/// Sending half of the event stream.
///
/// Sends never fail from the engine's point of view: events are dropped when
/// no receiver is attached or the receiver has gone away.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<EngineEvent>>,
}

impl EventSink {
    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a connected sink and its receiver.
    pub fn channel() -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
