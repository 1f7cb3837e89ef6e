//! Run metadata and run statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::AppResult;

/// Counter name → value, as reported by the event builder.
pub type EventCounts = BTreeMap<String, u64>;

/// Metadata of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    /// Run number assigned by the registrar. Kept after the run ends.
    pub run_number: Option<u64>,
    /// Set by START, cleared once STOP or SHUTDOWN completes.
    pub run_ongoing: bool,
    /// Run type given at START.
    pub run_type: String,
    /// Start comment, truncated to [`MAX_COMMENT_CHARS`].
    pub run_comment: String,
    /// Time the run was started.
    pub start_time: Option<DateTime<Utc>>,
}

/// Longest start comment stored or sent to the registrar.
pub const MAX_COMMENT_CHARS: usize = 500;

/// Truncates a comment to [`MAX_COMMENT_CHARS`] characters.
pub fn truncate_comment(comment: &str) -> String {
    comment.chars().take(MAX_COMMENT_CHARS).collect()
}

/// Source of the running event counters.
#[async_trait]
pub trait RunStatistics: Send + Sync {
    /// Current counters of the ongoing run.
    async fn event_counts(&self) -> AppResult<EventCounts>;
}

/// Statistics source for deployments without an event builder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStatistics;

#[async_trait]
impl RunStatistics for NoStatistics {
    async fn event_counts(&self) -> AppResult<EventCounts> {
        Ok(EventCounts::new())
    }
}

/// In-memory counters, updated by whoever observes the event builder.
#[derive(Debug, Default, Clone)]
pub struct SharedCounters {
    counts: Arc<RwLock<EventCounts>>,
}

impl SharedCounters {
    /// Creates an empty counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a counter.
    pub fn set(&self, name: impl Into<String>, value: u64) {
        self.counts.write().insert(name.into(), value);
    }

    /// Clears all counters, e.g. at run start.
    pub fn reset(&self) {
        self.counts.write().clear();
    }
}

#[async_trait]
impl RunStatistics for SharedCounters {
    async fn event_counts(&self) -> AppResult<EventCounts> {
        Ok(self.counts.read().clone())
    }
}
