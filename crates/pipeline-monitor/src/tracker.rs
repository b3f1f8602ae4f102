// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The correlation engine.
//!
//! A [`Tracker`] matches the start of work on an item with its eventual close
//! and reports the result:
//!
//! - `start_primary` opens a [`LatencyRecord`] under a [`CorrelationKey`]
//! - `start_secondary`/`end_secondary` time nested phases of an open record
//! - `end_primary` closes the record and sends a latency event, or an anomaly
//!   when the key is unknown or was already closed
//!
//! Records that leave the tracking cache without being closed (expired,
//! evicted for size, cleared) are reported by the cache's removal listener.
//! Registration operations and the periodic sweep are serialized by a single
//! lock; events are sent after the lock is released whenever the operation
//! produced them directly.

use crate::cache::{RemovalNotification, TrackingCache};
use crate::config::MonitorConfig;
use crate::creator::{DefaultEventCreator, EventCreator};
use crate::error::MonitorError;
use crate::event::{Event, EventProperties};
use crate::item::{WorkItem, WorkItemRef};
use crate::key::{CorrelationKey, Identity};
use crate::record::{LatencyRecord, Phase};
use crate::sampling::Sampler;
use crate::sink::{EventSink, LoggingEventSink};
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

pub use crate::event::Outcome;

/// Emit phases shorter than this are not reported.
pub const MIN_EMIT_LATENCY: Duration = Duration::from_millis(5);

pub const RECEIVED_COMPONENT_ATTR: &str = "receivedComponent";
pub const RECEIVED_STREAM_ATTR: &str = "receivedStream";
pub const TIME_ELAPSED_TO_START_ATTR: &str = "timeElapsedToStart";
pub const ABSOLUTE_LATENCY_ATTR: &str = "absoluteLatency";

const PRIVATE_FIELD_PREFIX: char = '_';
const QUEUE_TIME_FIELD: &str = "_queueTime";
const UNKNOWN_QUEUE_TIME: &str = "unknown";

/// Derives extra latency event properties from the item being closed.
pub type AttributeGenerator = Box<dyn Fn(&dyn WorkItem) -> EventProperties + Send + Sync>;

/// Decides at close time whether an item should be dropped silently. Receives
/// the item and whether the outcome was a success.
pub type IgnoreToggle = Box<dyn Fn(&dyn WorkItem, bool) -> bool + Send + Sync>;

/// Enriches events and hands them to the sink, swallowing every failure.
struct Emitter {
    sink: Arc<dyn EventSink>,
    custom_attributes: BTreeMap<String, String>,
}

impl Emitter {
    fn send(&self, mut event: Event) {
        event.merge_missing_attributes(
            self.custom_attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        if let Some(item) = event.item().cloned() {
            enrich_from_item(&mut event, item.as_ref());
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.sink.send(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to send event {:?}: {}", event.description(), e);
            }
            Err(_) => {
                warn!("Event sink panicked while sending {:?}", event.description());
            }
        }
    }
}

fn enrich_from_item(event: &mut Event, item: &dyn WorkItem) {
    let mut derived = vec![
        (
            RECEIVED_COMPONENT_ATTR.to_string(),
            item.source_component().to_string(),
        ),
        (
            RECEIVED_STREAM_ATTR.to_string(),
            item.source_stream().to_string(),
        ),
    ];
    for name in item.field_names() {
        if let Some(stripped) = name.strip_prefix(PRIVATE_FIELD_PREFIX) {
            if let Some(value) = item.field(name) {
                derived.push((stripped.to_string(), value));
            }
        }
    }
    event.merge_missing_attributes(derived);

    let Some(queue_time) = item
        .field(QUEUE_TIME_FIELD)
        .filter(|raw| raw != UNKNOWN_QUEUE_TIME)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
    else {
        return;
    };
    let Some(start_time) = event
        .attribute(crate::creator::START_TIME_MILLIS_ATTR)
        .and_then(|raw| raw.parse::<i64>().ok())
    else {
        return;
    };

    let elapsed_to_start = start_time - queue_time;
    let absolute = elapsed_to_start as f64 + event.metric();
    event.merge_missing_attributes([
        (
            TIME_ELAPSED_TO_START_ATTR.to_string(),
            elapsed_to_start.to_string(),
        ),
        (ABSOLUTE_LATENCY_ATTR.to_string(), absolute.to_string()),
    ]);
}

/// Tracks in-flight work items of one component and reports their latency.
pub struct Tracker {
    component: String,
    latencies: TrackingCache<CorrelationKey, LatencyRecord>,
    // Recently closed records, payload dropped, to tell a second close apart
    // from an unknown key.
    completed: TrackingCache<CorrelationKey, LatencyRecord>,
    registration: Mutex<()>,
    emitter: Arc<Emitter>,
    creator: Arc<dyn EventCreator>,
    extra_ack_exclusions: HashSet<String>,
    ignored_streams: HashSet<String>,
    sampler: Sampler,
    attribute_generator: Option<AttributeGenerator>,
    ignore_toggle: Option<IgnoreToggle>,
    sweep_interval: Duration,
    sweeper_running: Arc<AtomicBool>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("component", &self.component)
            .field("in_flight", &self.latencies.len())
            .field("sampler", &self.sampler)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// A builder for a tracker reporting as `component`.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> TrackerBuilder {
        TrackerBuilder::new(component)
    }

    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Number of open records, including expired ones not yet swept.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.latencies.len()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        #[allow(clippy::expect_used)]
        self.registration.lock().expect("lock poisoned")
    }

    /// Whether items like `item` should be tracked at all.
    #[must_use]
    pub fn should_monitor(&self, item: &dyn WorkItem) -> bool {
        !self.ignored_streams.contains(item.source_stream()) && self.samples(item.identity())
    }

    /// Whether the sampler keeps items with this identity.
    #[must_use]
    pub fn samples(&self, identity: Identity) -> bool {
        self.sampler.samples(identity)
    }

    /// Opens a record for `key`, replacing any record already open for it.
    pub fn start_primary(&self, key: CorrelationKey, service: &str, item: Option<WorkItemRef>) {
        let record = LatencyRecord::new(Instant::now(), service, item);
        let _guard = self.lock();
        self.completed.invalidate(&key);
        self.latencies.put(key, record);
        debug!("Tracking {} for {}", key, service);
    }

    /// Opens a secondary `phase` of the record for `key`, if there is one.
    pub fn start_secondary(&self, key: CorrelationKey, phase: Phase) {
        if phase.is_primary() {
            debug!("Ignoring secondary start of the primary phase for {}", key);
            return;
        }
        let now = Instant::now();
        let _guard = self.lock();
        if self.latencies.update(&key, |record| record.start(phase, now)).is_none() {
            trace!("No record for {} when starting {}", key, phase);
        }
    }

    /// Closes a secondary `phase` of the record for `key`, if there is one.
    pub fn end_secondary(&self, key: CorrelationKey, phase: Phase) {
        if phase.is_primary() {
            debug!("Ignoring secondary end of the primary phase for {}", key);
            return;
        }
        let now = Instant::now();
        let _guard = self.lock();
        if self.latencies.update(&key, |record| record.end(phase, now)).is_none() {
            trace!("No record for {} when ending {}", key, phase);
        }
    }

    /// Closes the record for `key` and reports it.
    pub fn end_primary(
        &self,
        key: CorrelationKey,
        properties: Option<EventProperties>,
        outcome: Outcome,
    ) {
        let now = Instant::now();
        let ended_at = chrono::Utc::now();

        let events = {
            let _guard = self.lock();
            let closed = self.latencies.update(&key, |record| {
                record.end(Phase::Process, now);
                let first = record.complete();
                (record.clone(), first)
            });

            match closed {
                Some((record, true)) => {
                    self.latencies.invalidate(&key);
                    let events = self.latency_events(&outcome, &record, ended_at, properties.as_ref());
                    let mut settled = record;
                    settled.take_item();
                    self.completed.put(key, settled);
                    events
                }
                Some((record, false)) => {
                    self.latencies.invalidate(&key);
                    warn!("Received a second completion for {}", key);
                    self.creator.double_completion_events(record.service(), &key)
                }
                None => match self.completed.get_if_present(&key) {
                    Some(record) => {
                        warn!("Received a second completion for {}", key);
                        self.creator.double_completion_events(record.service(), &key)
                    }
                    None => self.missing_key_events(&key, &outcome),
                },
            }
        };

        for event in events {
            self.emitter.send(event);
        }
    }

    fn latency_events(
        &self,
        outcome: &Outcome,
        record: &LatencyRecord,
        ended_at: chrono::DateTime<chrono::Utc>,
        properties: Option<&EventProperties>,
    ) -> Vec<Event> {
        let elapsed = record.duration(Phase::Process).unwrap_or_default();
        debug!(
            "Latency of {} is {}ms",
            record.service(),
            elapsed.as_millis()
        );
        let mut events = self
            .creator
            .latency_events(outcome, record, ended_at, elapsed, properties);

        if let Some(emit) = record.duration(Phase::Emit) {
            if emit >= MIN_EMIT_LATENCY {
                events.extend(
                    self.creator
                        .emit_latency_events(emit, &self.component, record.item()),
                );
            }
        }
        events
    }

    fn missing_key_events(&self, key: &CorrelationKey, outcome: &Outcome) -> Vec<Event> {
        if self.extra_ack_exclusions.contains(&self.component) {
            trace!("{} doesn't recognize {}, component is excluded", self.component, key);
            return Vec::new();
        }

        warn!("{} doesn't recognize {}", self.component, key);
        let mut events = self.creator.missing_key_events(&self.component, key);
        if let Outcome::Failure(reason) = outcome {
            events.extend(self.creator.error_events(reason, &self.component));
        }
        events
    }

    /// Closes `key` on behalf of `item`, applying the ignore toggle and the
    /// attribute generator.
    pub fn complete(&self, key: CorrelationKey, item: Option<&WorkItemRef>, outcome: Outcome) {
        if let (Some(toggle), Some(item)) = (&self.ignore_toggle, item) {
            if toggle(item.as_ref(), outcome.is_success()) {
                self.ignore(key);
                return;
            }
        }

        let properties = match (&self.attribute_generator, item) {
            (Some(generate), Some(item)) => Some(generate(item.as_ref())),
            _ => None,
        };
        self.end_primary(key, properties, outcome);
    }

    /// Stops tracking `key` without reporting anything.
    pub fn ignore(&self, key: CorrelationKey) {
        let _guard = self.lock();
        if self.latencies.invalidate(&key) {
            debug!("Ignoring {}", key);
        }
    }

    /// Enriches `event` and sends it. Never fails.
    pub fn send(&self, event: Event) {
        self.emitter.send(event);
    }

    /// Reports an error raised by the component.
    pub fn report_error<E: Error + 'static>(&self, error: &E) {
        self.send(Event::from_error(error).with_service(self.component.as_str()));
    }

    /// Reports one processed unit.
    pub fn record_throughput(&self, item: Option<&WorkItemRef>) {
        self.send(Event::throughput(&self.component).with_item(item.cloned()));
    }

    /// Sweeps expired records, reporting each one.
    pub fn cleanup(&self) {
        let _guard = self.lock();
        self.latencies.cleanup();
        self.completed.cleanup();
    }

    /// Starts the periodic sweep on the current tokio runtime.
    ///
    /// The first sweep runs after the configured interval plus or minus half
    /// of it, so trackers started together do not sweep in lock-step.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<SweepHandle, MonitorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MonitorError::SweepTask(e.to_string()))?;

        if self.sweeper_running.swap(true, Ordering::AcqRel) {
            return Err(MonitorError::SweepAlreadyRunning);
        }

        let period = self.sweep_interval;
        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        let offset = Duration::from_millis((period_ms / 2).saturating_add(fastrand::u64(0..=period_ms)));

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tracker = Arc::downgrade(self);
        let running = Arc::clone(&self.sweeper_running);

        debug!(
            "Starting sweeper for {} every {}s, first in {}ms",
            self.component,
            period.as_secs(),
            offset.as_millis()
        );

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + offset, period);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(tracker) = tracker.upgrade() else {
                            break;
                        };
                        tracker.cleanup();
                    }
                }
            }
            running.store(false, Ordering::Release);
            debug!("Sweeper stopped");
        });

        Ok(SweepHandle {
            guard: token.drop_guard(),
            task,
        })
    }
}

/// Controls a running sweep task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweepHandle {
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Stops the sweep and waits for the task to finish.
    pub async fn stop(self) -> Result<(), MonitorError> {
        drop(self.guard);
        self.task
            .await
            .map_err(|e| MonitorError::SweepTask(e.to_string()))
    }
}

/// Assembles a [`Tracker`].
pub struct TrackerBuilder {
    component: String,
    config: MonitorConfig,
    sink: Arc<dyn EventSink>,
    creator: Arc<dyn EventCreator>,
    attribute_generator: Option<AttributeGenerator>,
    ignore_toggle: Option<IgnoreToggle>,
}

impl TrackerBuilder {
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            config: MonitorConfig::default(),
            sink: Arc::new(LoggingEventSink),
            creator: Arc::new(DefaultEventCreator),
            attribute_generator: None,
            ignore_toggle: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    #[must_use]
    pub fn creator(mut self, creator: impl EventCreator + 'static) -> Self {
        self.creator = Arc::new(creator);
        self
    }

    #[must_use]
    pub fn attribute_generator<F>(mut self, generate: F) -> Self
    where
        F: Fn(&dyn WorkItem) -> EventProperties + Send + Sync + 'static,
    {
        self.attribute_generator = Some(Box::new(generate));
        self
    }

    #[must_use]
    pub fn ignore_toggle<F>(mut self, toggle: F) -> Self
    where
        F: Fn(&dyn WorkItem, bool) -> bool + Send + Sync + 'static,
    {
        self.ignore_toggle = Some(Box::new(toggle));
        self
    }

    pub fn build(self) -> Result<Tracker, MonitorError> {
        self.config.validate()?;
        let MonitorConfig {
            cache,
            extra_ack_exclusions,
            ignored_streams,
            custom_attributes,
            sample_every,
            sweep_interval,
            ..
        } = self.config;

        let emitter = Arc::new(Emitter {
            sink: self.sink,
            custom_attributes,
        });

        let listener = {
            let emitter = Arc::clone(&emitter);
            let creator = Arc::clone(&self.creator);
            let component = self.component.clone();
            move |notification: RemovalNotification<CorrelationKey, LatencyRecord>| {
                if !notification.cause.was_evicted() || notification.value.is_completed() {
                    return;
                }
                debug!(
                    "{} removed from {} cache: {}",
                    notification.key, component, notification.cause
                );
                for event in creator.expiry_removal_events(&notification, &component) {
                    emitter.send(event);
                }
            }
        };

        Ok(Tracker {
            latencies: TrackingCache::with_removal_listener(cache, listener),
            completed: TrackingCache::new(cache),
            component: self.component,
            registration: Mutex::new(()),
            emitter,
            creator: self.creator,
            extra_ack_exclusions,
            ignored_streams,
            sampler: Sampler::new(sample_every),
            attribute_generator: self.attribute_generator,
            ignore_toggle: self.ignore_toggle,
            sweep_interval,
            sweeper_running: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::creator::{ERROR_ATTR, MISSING_KEY_TAG, START_TIME_MILLIS_ATTR};
    use crate::error::SinkError;
    use crate::event::{EventKind, State};
    use crate::item::Tuple;
    use crate::sink::MemorySink;
    use tracing_test::traced_test;

    fn key() -> CorrelationKey {
        CorrelationKey::new(Identity::next(), Identity::next())
    }

    fn tracker_with(config: MonitorConfig) -> (Tracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::builder("enricher")
            .config(config)
            .sink(Arc::clone(&sink))
            .build()
            .unwrap();
        (tracker, sink)
    }

    fn tracker() -> (Tracker, Arc<MemorySink>) {
        tracker_with(MonitorConfig::default())
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn send(&self, _event: &Event) -> Result<(), SinkError> {
            Err(SinkError::Transport("connection refused".to_string()))
        }
    }

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn send(&self, _event: &Event) -> Result<(), SinkError> {
            panic!("sink exploded")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_latency() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tokio::time::advance(Duration::from_millis(30)).await;
        tracker.end_primary(key, None, Outcome::Success);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Latency);
        assert_eq!(events[0].metric(), 30.0);
        assert_eq!(events[0].state(), Some(State::Success));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_carries_reason() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tracker.end_primary(key, None, Outcome::Failure("bad record".to_string()));

        let event = &sink.events()[0];
        assert_eq!(event.state(), Some(State::Failure));
        assert_eq!(event.attribute(ERROR_ATTR), Some("bad record"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_failure_also_reports_error() {
        let (tracker, sink) = tracker();
        tracker.end_primary(key(), None, Outcome::Failure("bad record".to_string()));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].has_tag(MISSING_KEY_TAG));
        assert_eq!(events[1].description(), Some("bad record"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_phase_on_unknown_key_is_ignored() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_secondary(key, Phase::Emit);
        tracker.end_secondary(key, Phase::Emit);

        assert_eq!(tracker.in_flight(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_emit_phase_is_not_reported() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tracker.start_secondary(key, Phase::Emit);
        tokio::time::advance(Duration::from_millis(4)).await;
        tracker.end_secondary(key, Phase::Emit);
        tracker.end_primary(key, None, Outcome::Success);

        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_record_without_anomaly() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tokio::time::advance(Duration::from_millis(10)).await;
        tracker.start_primary(key, "enricher", None);
        tokio::time::advance(Duration::from_millis(5)).await;
        tracker.end_primary(key, None, Outcome::Success);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_close_is_not_a_double_completion() {
        let (tracker, sink) = tracker();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tracker.end_primary(key, None, Outcome::Success);
        tracker.start_primary(key, "enricher", None);
        tracker.end_primary(key, None, Outcome::Success);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind() == EventKind::Latency));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_enriches_from_item() {
        let mut config = MonitorConfig::default();
        config
            .custom_attributes
            .insert("env".to_string(), "prod".to_string());
        let (tracker, sink) = tracker_with(config);

        let item = Tuple::new("kafka-spout", "orders")
            .with_field("_customer", "acme")
            .with_field("_env", "staging")
            .with_field("amount", 12)
            .into_ref();
        tracker.send(
            Event::new()
                .with_attribute("customer", "caller")
                .with_item(Some(item)),
        );

        let event = &sink.events()[0];
        assert_eq!(event.attribute("customer"), Some("caller"));
        assert_eq!(event.attribute("env"), Some("prod"));
        assert_eq!(event.attribute(RECEIVED_COMPONENT_ATTR), Some("kafka-spout"));
        assert_eq!(event.attribute(RECEIVED_STREAM_ATTR), Some("orders"));
        assert_eq!(event.attribute("amount"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_time_is_derived() {
        let (tracker, sink) = tracker();
        let item = Tuple::new("kafka-spout", "orders")
            .with_field(QUEUE_TIME_FIELD, 1_000)
            .into_ref();

        tracker.send(
            Event::latency(20.0, "enricher")
                .with_attribute(START_TIME_MILLIS_ATTR, 1_250)
                .with_item(Some(item)),
        );

        let event = &sink.events()[0];
        assert_eq!(event.attribute(TIME_ELAPSED_TO_START_ATTR), Some("250"));
        assert_eq!(event.attribute(ABSOLUTE_LATENCY_ATTR), Some("270"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_queue_time_is_skipped() {
        let (tracker, sink) = tracker();
        let item = Tuple::new("kafka-spout", "orders")
            .with_field(QUEUE_TIME_FIELD, UNKNOWN_QUEUE_TIME)
            .into_ref();

        tracker.send(
            Event::latency(20.0, "enricher")
                .with_attribute(START_TIME_MILLIS_ATTR, 1_250)
                .with_item(Some(item)),
        );

        assert_eq!(sink.events()[0].attribute(TIME_ELAPSED_TO_START_ATTR), None);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_sink_errors_are_swallowed() {
        let tracker = Tracker::builder("enricher").sink(FailingSink).build().unwrap();
        let key = key();

        tracker.start_primary(key, "enricher", None);
        tracker.end_primary(key, None, Outcome::Success);

        assert!(logs_contain("Failed to send event"));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_sink_panics_are_swallowed() {
        let tracker = Tracker::builder("enricher").sink(PanickingSink).build().unwrap();
        tracker.record_throughput(None);
        assert!(logs_contain("Event sink panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_error() {
        let (tracker, sink) = tracker();
        tracker.report_error(&SinkError::Transport("connection refused".to_string()));

        let event = &sink.events()[0];
        assert_eq!(event.kind(), EventKind::Exception);
        assert_eq!(event.service(), Some("enricher"));
        assert_eq!(event.attribute("errorType"), Some("SinkError"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_throughput() {
        let (tracker, sink) = tracker();
        tracker.record_throughput(None);

        let event = &sink.events()[0];
        assert_eq!(event.metric(), 1.0);
        assert_eq!(event.service(), Some("enricher throughput."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_toggle_suppresses_close() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::builder("enricher")
            .sink(Arc::clone(&sink))
            .ignore_toggle(|_, success| !success)
            .build()
            .unwrap();
        let item = Tuple::new("kafka-spout", "orders").into_ref();
        let key = key();

        tracker.start_primary(key, "enricher", Some(Arc::clone(&item)));
        tracker.complete(key, Some(&item), Outcome::Failure("skip".to_string()));

        assert!(sink.events().is_empty());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attribute_generator_runs_at_close() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Tracker::builder("enricher")
            .sink(Arc::clone(&sink))
            .attribute_generator(|item| {
                EventProperties::new()
                    .with_attribute("origin", item.source_component())
                    .with_tag("generated")
            })
            .build()
            .unwrap();
        let item = Tuple::new("kafka-spout", "orders").into_ref();
        let key = key();

        tracker.start_primary(key, "enricher", Some(Arc::clone(&item)));
        tracker.complete(key, Some(&item), Outcome::Success);

        let event = &sink.events()[0];
        assert_eq!(event.attribute("origin"), Some("kafka-spout"));
        assert!(event.has_tag("generated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_monitor_skips_ignored_streams() {
        let mut config = MonitorConfig::default();
        config.ignored_streams.insert("heartbeat".to_string());
        let (tracker, _sink) = tracker_with(config);

        assert!(!tracker.should_monitor(&Tuple::new("kafka-spout", "heartbeat")));
        assert!(tracker.should_monitor(&Tuple::new("kafka-spout", "orders")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_eviction_is_reported_without_payload() {
        let config = MonitorConfig {
            cache: CacheConfig {
                max_size: 1,
                max_age: Duration::from_secs(60),
                concurrency: 1,
            },
            ..Default::default()
        };
        let (tracker, sink) = tracker_with(config);
        let item = Tuple::new("kafka-spout", "orders").into_ref();

        tracker.start_primary(key(), "enricher", Some(item));
        tracker.start_primary(key(), "enricher", None);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("removalCause"), Some("SIZE"));
        assert!(!events[0].has_tag("pii"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = MonitorConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(Tracker::builder("enricher").config(config).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reports_expired_records() {
        let config = MonitorConfig {
            cache: CacheConfig {
                max_size: 100,
                max_age: Duration::from_secs(1),
                concurrency: 2,
            },
            sweep_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let (tracker, sink) = tracker_with(config);
        let tracker = Arc::new(tracker);

        let handle = tracker.spawn_sweeper().unwrap();
        assert!(matches!(
            tracker.spawn_sweeper(),
            Err(MonitorError::SweepAlreadyRunning)
        ));

        tracker.start_primary(key(), "enricher", None);
        tokio::time::sleep(Duration::from_secs(16)).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("removalCause"), Some("EXPIRED"));

        handle.stop().await.unwrap();
        assert!(tracker.spawn_sweeper().is_ok());
    }

    #[test]
    fn test_sweeper_needs_a_runtime() {
        let (tracker, _sink) = tracker();
        assert!(matches!(
            Arc::new(tracker).spawn_sweeper(),
            Err(MonitorError::SweepTask(_))
        ));
    }
}
