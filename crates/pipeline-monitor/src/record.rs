// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-item phase timestamps.

use crate::item::WorkItemRef;
use derive_more::Display;
use hashbrown::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A measured span of work on an item.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Total processing time, from start until the component confirms the item.
    #[display("process")]
    Process,
    /// Time spent handing the item downstream, nested in `Process`.
    #[display("emit")]
    Emit,
}

impl Phase {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Phase::Process)
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: Instant,
    end: Option<Instant>,
}

/// Timestamps of every phase of one tracked item.
#[derive(Debug, Clone)]
pub struct LatencyRecord {
    spans: HashMap<Phase, Span>,
    completed: bool,
    service: String,
    item: Option<WorkItemRef>,
}

impl LatencyRecord {
    /// Starts a record with the primary phase opened at `started`.
    #[must_use]
    pub fn new(started: Instant, service: impl Into<String>, item: Option<WorkItemRef>) -> Self {
        let mut spans = HashMap::with_capacity(2);
        spans.insert(
            Phase::Process,
            Span {
                start: started,
                end: None,
            },
        );
        Self {
            spans,
            completed: false,
            service: service.into(),
            item,
        }
    }

    /// (Re)opens `phase`, discarding any earlier timestamps for it.
    pub fn start(&mut self, phase: Phase, at: Instant) {
        self.spans.insert(phase, Span { start: at, end: None });
    }

    /// Closes `phase`. Returns false if the phase was never started.
    pub fn end(&mut self, phase: Phase, at: Instant) -> bool {
        match self.spans.get_mut(&phase) {
            Some(span) => {
                span.end = Some(at);
                true
            }
            None => false,
        }
    }

    /// Elapsed time of a phase with both timestamps set.
    #[must_use]
    pub fn duration(&self, phase: Phase) -> Option<Duration> {
        let span = self.spans.get(&phase)?;
        span.end.map(|end| end.saturating_duration_since(span.start))
    }

    /// Marks the record completed. Returns false if it already was.
    pub fn complete(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn item(&self) -> Option<&WorkItemRef> {
        self.item.as_ref()
    }

    /// Releases the retained work item.
    pub fn take_item(&mut self) -> Option<WorkItemRef> {
        self.item.take()
    }
}
