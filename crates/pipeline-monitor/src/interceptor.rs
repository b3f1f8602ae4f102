// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks a pipeline component wrapper calls into.
//!
//! The wrapper stays outside this crate; it only has to call `on_start` when
//! its component receives an item, bracket every emission with
//! `on_emit_start`/`on_emit_end` (or wrap it in
//! [`OutputInterceptorExt::around_emit`]) and report the outcome with
//! `on_ack` or `on_fail`.

use crate::event::EventProperties;
use crate::item::WorkItemRef;
use crate::key::{CorrelationKey, Identity};
use crate::record::Phase;
use crate::tracker::{Outcome, Tracker};
use std::error::Error;
use std::sync::Arc;

/// Lifecycle hooks of an instrumented processing component.
pub trait OutputInterceptor: Send + Sync {
    /// The component started working on `item`.
    fn on_start(&self, item: &WorkItemRef);

    /// The component finished with `item`.
    fn on_close(&self, item: &WorkItemRef, outcome: Outcome);

    /// The component starts handing output anchored on `anchors` downstream.
    fn on_emit_start(&self, anchors: &[WorkItemRef]);

    /// The emission opened by `on_emit_start` returned.
    fn on_emit_end(&self, anchors: &[WorkItemRef]);

    fn on_ack(&self, item: &WorkItemRef) {
        self.on_close(item, Outcome::Success);
    }

    fn on_fail(&self, item: &WorkItemRef, reason: &str) {
        self.on_close(item, Outcome::Failure(reason.to_string()));
    }
}

/// Helpers available on every [`OutputInterceptor`], trait objects included.
pub trait OutputInterceptorExt: OutputInterceptor {
    /// Runs `emit`, timing it as the emit phase of every anchor.
    fn around_emit<R>(&self, anchors: &[WorkItemRef], emit: impl FnOnce() -> R) -> R {
        self.on_emit_start(anchors);
        let emitted = emit();
        self.on_emit_end(anchors);
        emitted
    }
}

impl<T: OutputInterceptor + ?Sized> OutputInterceptorExt for T {}

/// Tracks the items one component instance processes.
#[derive(Debug, Clone)]
pub struct ComponentInterceptor {
    owner: Identity,
    tracker: Arc<Tracker>,
}

impl ComponentInterceptor {
    /// An interceptor for a fresh component instance.
    #[must_use]
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            owner: Identity::next(),
            tracker,
        }
    }

    #[must_use]
    pub fn owner(&self) -> Identity {
        self.owner
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    fn key(&self, item: &WorkItemRef) -> CorrelationKey {
        CorrelationKey::new(self.owner, item.identity())
    }

    fn monitored_keys(&self, anchors: &[WorkItemRef]) -> Vec<CorrelationKey> {
        anchors
            .iter()
            .filter(|anchor| self.tracker.should_monitor(anchor.as_ref()))
            .map(|anchor| self.key(anchor))
            .collect()
    }

    /// The component raised an error outside of any item's outcome.
    pub fn on_error<E: Error + 'static>(&self, error: &E) {
        self.tracker.report_error(error);
    }
}

impl OutputInterceptor for ComponentInterceptor {
    fn on_start(&self, item: &WorkItemRef) {
        if !self.tracker.should_monitor(item.as_ref()) {
            return;
        }
        self.tracker
            .start_primary(self.key(item), self.tracker.component(), Some(Arc::clone(item)));
    }

    fn on_close(&self, item: &WorkItemRef, outcome: Outcome) {
        if !self.tracker.should_monitor(item.as_ref()) {
            return;
        }
        self.tracker.complete(self.key(item), Some(item), outcome);
    }

    fn on_emit_start(&self, anchors: &[WorkItemRef]) {
        for key in self.monitored_keys(anchors) {
            self.tracker.start_secondary(key, Phase::Emit);
        }
    }

    fn on_emit_end(&self, anchors: &[WorkItemRef]) {
        for key in self.monitored_keys(anchors) {
            self.tracker.end_secondary(key, Phase::Emit);
        }
    }
}

/// Tracks the work a source component emits under its own message ids, from
/// emission until the pipeline acknowledges or fails the message.
#[derive(Debug, Clone)]
pub struct SourceInterceptor {
    owner: Identity,
    tracker: Arc<Tracker>,
    id_attribute: Option<String>,
}

impl SourceInterceptor {
    #[must_use]
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            owner: Identity::next(),
            tracker,
            id_attribute: None,
        }
    }

    /// Reports the message id under `name` on every latency event.
    #[must_use]
    pub fn with_id_attribute(mut self, name: impl Into<String>) -> Self {
        self.id_attribute = Some(name.into());
        self
    }

    fn key(&self, message_id: u64) -> CorrelationKey {
        CorrelationKey::new(self.owner, Identity::from_raw(message_id))
    }

    /// The source emitted `message_id`, optionally carrying `item`.
    ///
    /// Sampling looks at the message id alone, the only thing the matching
    /// `on_ack`/`on_fail` gets to see.
    pub fn on_emit(&self, message_id: u64, item: Option<WorkItemRef>) {
        if !self.tracker.samples(Identity::from_raw(message_id)) {
            return;
        }
        self.tracker
            .start_primary(self.key(message_id), self.tracker.component(), item);
    }

    pub fn on_ack(&self, message_id: u64) {
        self.close(message_id, Outcome::Success);
    }

    pub fn on_fail(&self, message_id: u64, reason: impl Into<String>) {
        self.close(message_id, Outcome::Failure(reason.into()));
    }

    fn close(&self, message_id: u64, outcome: Outcome) {
        if !self.tracker.samples(Identity::from_raw(message_id)) {
            return;
        }
        let properties = self
            .id_attribute
            .as_ref()
            .map(|name| EventProperties::new().with_attribute(name.as_str(), message_id.to_string()));
        self.tracker
            .end_primary(self.key(message_id), properties, outcome);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::creator::{EMIT_LATENCY_TAG, MISSING_KEY_TAG};
    use crate::error::SinkError;
    use crate::event::{EventKind, State};
    use crate::item::Tuple;
    use crate::sink::MemorySink;
    use std::time::Duration;

    fn interceptor(config: MonitorConfig) -> (ComponentInterceptor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::builder("enricher")
            .config(config)
            .sink(Arc::clone(&sink))
            .build()
            .unwrap();
        (ComponentInterceptor::new(Arc::new(tracker)), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_emit() {
        let (interceptor, sink) = interceptor(MonitorConfig::default());
        let item = Tuple::new("kafka-spout", "orders").into_ref();

        interceptor.on_start(&item);
        tokio::time::advance(Duration::from_millis(2)).await;
        let emitted = interceptor.around_emit(std::slice::from_ref(&item), || 3);
        tokio::time::advance(Duration::from_millis(10)).await;
        interceptor.on_ack(&item);

        assert_eq!(emitted, 3);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric(), 12.0);
        assert!(!events[0].has_tag(EMIT_LATENCY_TAG));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_reports_failure() {
        let (interceptor, sink) = interceptor(MonitorConfig::default());
        let item = Tuple::new("kafka-spout", "orders").into_ref();

        interceptor.on_start(&item);
        interceptor.on_fail(&item, "timeout");

        let event = &sink.events()[0];
        assert_eq!(event.kind(), EventKind::Latency);
        assert_eq!(event.state(), Some(State::Failure));
        assert_eq!(event.attribute("receivedComponent"), Some("kafka-spout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_owners_do_not_collide() {
        let (first, sink) = interceptor(MonitorConfig::default());
        let second = ComponentInterceptor::new(Arc::clone(first.tracker()));
        let item = Tuple::new("kafka-spout", "orders").into_ref();

        first.on_start(&item);
        second.on_ack(&item);
        first.on_ack(&item);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].has_tag(MISSING_KEY_TAG));
        assert_eq!(events[1].kind(), EventKind::Latency);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_stream_is_not_tracked() {
        let mut config = MonitorConfig::default();
        config.ignored_streams.insert("heartbeat".to_string());
        let (interceptor, sink) = interceptor(config);
        let item = Tuple::new("kafka-spout", "heartbeat").into_ref();

        interceptor.on_start(&item);
        interceptor.on_ack(&item);

        assert_eq!(interceptor.tracker().in_flight(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error() {
        let (interceptor, sink) = interceptor(MonitorConfig::default());
        interceptor.on_error(&SinkError::Closed);

        let event = &sink.events()[0];
        assert_eq!(event.description(), Some("Sink closed"));
        assert_eq!(event.service(), Some("enricher"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_reports_message_id() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::builder("kafka-spout")
            .sink(Arc::clone(&sink))
            .build()
            .unwrap();
        let source = SourceInterceptor::new(Arc::new(tracker)).with_id_attribute("messageId");

        source.on_emit(17, None);
        tokio::time::advance(Duration::from_millis(40)).await;
        source.on_ack(17);
        source.on_fail(18, "lost");

        let events = sink.events();
        assert_eq!(events[0].metric(), 40.0);
        assert_eq!(events[0].attribute("messageId"), Some("17"));
        assert!(events[1].has_tag(MISSING_KEY_TAG));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_sampling_ignores_attached_items() {
        let sink = Arc::new(MemorySink::new());
        let config = MonitorConfig {
            sample_every: 2,
            ..Default::default()
        };
        let tracker = Tracker::builder("kafka-spout")
            .config(config)
            .sink(Arc::clone(&sink))
            .build()
            .unwrap();
        let source = SourceInterceptor::new(Arc::new(tracker));

        for id in 0..1000u64 {
            let item = Tuple::new("kafka-spout", "orders").with_field("n", id).into_ref();
            source.on_emit(id, Some(item));
            source.on_ack(id);
        }

        let events = sink.events();
        assert!(events.iter().all(|e| !e.has_tag(MISSING_KEY_TAG)));
        assert!(events.iter().all(|e| e.kind() == EventKind::Latency));
        assert!(events.len() > 350 && events.len() < 650, "sampled {}", events.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interceptor_behind_trait_object() {
        let (interceptor, sink) = interceptor(MonitorConfig::default());
        let hooks: Box<dyn OutputInterceptor> = Box::new(interceptor);
        let item = Tuple::new("kafka-spout", "orders").into_ref();

        hooks.on_start(&item);
        hooks.around_emit(std::slice::from_ref(&item), || ());
        hooks.on_emit_start(std::slice::from_ref(&item));
        tokio::time::advance(Duration::from_millis(6)).await;
        hooks.on_emit_end(std::slice::from_ref(&item));
        hooks.on_fail(&item, "rejected");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].state(), Some(State::Failure));
        assert_eq!(events[0].metric(), 6.0);
        assert_eq!(events[1].metric(), 6.0);
        assert!(events[1].has_tag(EMIT_LATENCY_TAG));
    }
}
