// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event sinks.
//!
//! The tracker treats a sink as fire-and-forget: it calls [`EventSink::send`]
//! synchronously, logs any error and moves on. Retrying is the sink's job.

use crate::error::SinkError;
use crate::event::Event;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

const DEFAULT_TTL_SECS: f32 = 5.0;
const DEFAULT_BASE_TAG: &str = "pipeline";

/// Destination for finished events.
pub trait EventSink: Send + Sync {
    /// Hands `event` over for transmission. Must tolerate partially filled events.
    fn send(&self, event: &Event) -> Result<(), SinkError>;
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn send(&self, event: &Event) -> Result<(), SinkError> {
        (**self).send(event)
    }
}

/// Writes each event to the log at info level. The fallback when no collector
/// is reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn send(&self, event: &Event) -> Result<(), SinkError> {
        let payload = serde_json::to_string(event)?;
        info!("event {}", payload);
        Ok(())
    }
}

/// Forwards events to a transmitter task over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: &Event) -> Result<(), SinkError> {
        self.tx.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Keeps every event in memory. Handy for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        #[allow(clippy::expect_used)]
        let events = self.events.lock().expect("lock poisoned");
        events.clone()
    }

    /// Removes and returns the events received so far.
    pub fn drain(&self) -> Vec<Event> {
        #[allow(clippy::expect_used)]
        let mut events = self.events.lock().expect("lock poisoned");
        std::mem::take(&mut *events)
    }
}

impl EventSink for MemorySink {
    fn send(&self, event: &Event) -> Result<(), SinkError> {
        #[allow(clippy::expect_used)]
        let mut events = self.events.lock().expect("lock poisoned");
        events.push(event.clone());
        Ok(())
    }
}

/// Fills in the wire fields the collector expects before delegating.
///
/// Sets `time` (epoch seconds) when missing, a default `ttl`, a base tag
/// identifying the producer, an optional `host`, and prefixes the service
/// with the machine name when one is known.
#[derive(Debug, Clone)]
pub struct StampingSink<S> {
    inner: S,
    machine_name: Option<String>,
    host: Option<String>,
    base_tag: String,
    default_ttl: f32,
}

impl<S: EventSink> StampingSink<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            machine_name: None,
            host: None,
            base_tag: DEFAULT_BASE_TAG.to_string(),
            default_ttl: DEFAULT_TTL_SECS,
        }
    }

    #[must_use]
    pub fn with_machine_name(mut self, machine_name: impl Into<String>) -> Self {
        self.machine_name = Some(machine_name.into());
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_base_tag(mut self, tag: impl Into<String>) -> Self {
        self.base_tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: f32) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn stamp(&self, event: &Event) -> Event {
        let mut stamped = event.clone().with_tag(self.base_tag.as_str());
        if stamped.time().is_none() {
            stamped = stamped.with_time(chrono::Utc::now().timestamp());
        }
        if stamped.ttl().is_none() {
            stamped = stamped.with_ttl(self.default_ttl);
        }
        if stamped.host().is_none() {
            if let Some(host) = &self.host {
                stamped = stamped.with_host(host.as_str());
            }
        }
        if let Some(machine) = &self.machine_name {
            let service = match stamped.service() {
                Some(service) => format!("{machine} {service}"),
                None => machine.clone(),
            };
            stamped = stamped.with_service(service);
        }
        stamped
    }
}

impl<S: EventSink> EventSink for StampingSink<S> {
    fn send(&self, event: &Event) -> Result<(), SinkError> {
        let stamped = self.stamp(event);
        self.inner.send(&stamped)?;
        debug!("Event sent - {:?}", stamped.description());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_logging_sink_logs_payload() {
        let event = Event::latency(12.0, "parser");
        LoggingEventSink.send(&event).expect("log sink never fails");
        assert!(logs_contain("parser latency."));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.send(&Event::exception("boom")).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.description(), Some("boom"));
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        assert!(matches!(
            sink.send(&Event::exception("boom")),
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn test_memory_sink_drain() {
        let sink = MemorySink::new();
        sink.send(&Event::throughput("parser")).unwrap();
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_stamping_sink_fills_wire_fields() {
        let memory = Arc::new(MemorySink::new());
        let sink = StampingSink::new(Arc::clone(&memory))
            .with_machine_name("worker-3")
            .with_host("10.0.0.3");

        sink.send(&Event::latency(3.0, "parser")).unwrap();

        let events = memory.events();
        let sent = &events[0];
        assert_eq!(sent.service(), Some("worker-3 parser latency."));
        assert_eq!(sent.ttl(), Some(5.0));
        assert_eq!(sent.host(), Some("10.0.0.3"));
        assert!(sent.time().is_some_and(|t| t > 0));
        assert!(sent.has_tag("pipeline"));
        assert!(sent.has_tag("latency"));
    }

    #[test]
    fn test_stamping_sink_keeps_explicit_fields() {
        let memory = Arc::new(MemorySink::new());
        let sink = StampingSink::new(Arc::clone(&memory))
            .with_base_tag("storm")
            .with_default_ttl(30.0);

        sink.send(&Event::new().with_ttl(1.0).with_time(42)).unwrap();

        let sent = &memory.events()[0];
        assert_eq!(sent.ttl(), Some(1.0));
        assert_eq!(sent.time(), Some(42));
        assert_eq!(sent.service(), None);
        assert_eq!(sent.tags(), ["storm"]);
    }
}
