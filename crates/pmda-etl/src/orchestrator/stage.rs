//! Run stages and outcomes

use crate::state::{FailureSummary, RunMode, RunStatus};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use uuid::Uuid;

/// Position of a run in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initializing,
    Fetching,
    Parsing,
    Transforming,
    Staging,
    Applying,
    Finalizing,
}

impl Stage {
    const ALL: [Stage; 7] = [
        Stage::Initializing,
        Stage::Fetching,
        Stage::Parsing,
        Stage::Transforming,
        Stage::Staging,
        Stage::Applying,
        Stage::Finalizing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Fetching => "fetching",
            Stage::Parsing => "parsing",
            Stage::Transforming => "transforming",
            Stage::Staging => "staging",
            Stage::Applying => "applying",
            Stage::Finalizing => "finalizing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest stage reached, shared by the closures of a streaming run
#[derive(Debug)]
pub(crate) struct StageTracker(AtomicU8);

impl StageTracker {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Stage::Initializing as u8))
    }

    pub(crate) fn enter(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    pub(crate) fn current(&self) -> Stage {
        let raw = self.0.load(Ordering::Relaxed) as usize;
        Stage::ALL.get(raw).copied().unwrap_or(Stage::Initializing)
    }
}

/// What a call to [`super::Orchestrator::run`] reports back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub dataset: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub watermark: Option<Value>,
    pub failure: Option<FailureSummary>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}
