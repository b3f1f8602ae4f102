// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event payloads handed to an [`crate::sink::EventSink`].
//!
//! Events serialize to the shape the collector expects:
//!
//! ```text
//! {description, service, state, metric, tags, attributes, time, ttl}
//! ```
//!
//! The attribute bag stays mutable until the event is sent so the tracker can
//! merge in process-wide and item-derived attributes.

use crate::item::WorkItemRef;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;

pub const LATENCY_TAG: &str = "latency";
pub const EXCEPTION_TAG: &str = "exception";
pub const THROUGHPUT_TAG: &str = "throughput";

pub const ERROR_STACK_ATTR: &str = "errorStack";
pub const ERROR_TYPE_ATTR: &str = "errorType";

/// Outcome carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Success,
    Failure,
}

/// How a component finished with a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Failed, with a human readable reason.
    Failure(String),
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    #[must_use]
    pub fn state(&self) -> State {
        match self {
            Outcome::Success => State::Success,
            Outcome::Failure(_) => State::Failure,
        }
    }
}

/// Which family an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Latency,
    Exception,
    Throughput,
    Custom,
}

/// A metric event on its way to the collector.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(skip)]
    kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    description: Option<String>,
    service: Option<String>,
    state: Option<State>,
    metric: f64,
    tags: Vec<String>,
    attributes: BTreeMap<String, String>,
    time: Option<i64>,
    ttl: Option<f32>,
    #[serde(skip)]
    item: Option<WorkItemRef>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    /// An empty custom event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: EventKind::Custom,
            host: None,
            description: None,
            service: None,
            state: None,
            metric: 0.0,
            tags: Vec::new(),
            attributes: BTreeMap::new(),
            time: None,
            ttl: None,
            item: None,
        }
    }

    /// A successful latency measurement, in milliseconds, for `service`.
    #[must_use]
    pub fn latency(millis: f64, service: &str) -> Self {
        let mut event = Self::new()
            .with_service(format!("{service} latency."))
            .with_state(State::Success)
            .with_metric(millis)
            .with_tag(LATENCY_TAG);
        event.kind = EventKind::Latency;
        event
    }

    /// One processed unit for `service`. The metric is fixed at 1.
    #[must_use]
    pub fn throughput(service: &str) -> Self {
        let mut event = Self::new()
            .with_service(format!("{service} throughput."))
            .with_metric(1.0)
            .with_tag(THROUGHPUT_TAG);
        event.kind = EventKind::Throughput;
        event
    }

    /// An anomaly described by `message`.
    #[must_use]
    pub fn exception(message: impl Into<String>) -> Self {
        let mut event = Self::new()
            .with_description(message)
            .with_tag(EXCEPTION_TAG);
        event.kind = EventKind::Exception;
        event
    }

    /// An anomaly built from an error and its chain of sources.
    ///
    /// The description is the innermost cause; the full chain, outermost
    /// first, goes to the `errorStack` attribute.
    #[must_use]
    pub fn from_error<E: Error + 'static>(error: &E) -> Self {
        let mut chain = vec![error.to_string()];
        let mut innermost: &(dyn Error + 'static) = error;
        while let Some(source) = innermost.source() {
            chain.push(source.to_string());
            innermost = source;
        }

        let type_name = std::any::type_name::<E>();
        let short_type = type_name.rsplit("::").next().unwrap_or(type_name);

        Self::exception(innermost.to_string())
            .with_attribute(ERROR_TYPE_ATTR, short_type)
            .with_attribute(ERROR_STACK_ATTR, chain.join("\ncaused by: "))
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the metric. Throughput events keep their fixed metric of 1.
    #[must_use]
    pub fn with_metric(mut self, metric: f64) -> Self {
        if self.kind != EventKind::Throughput {
            self.metric = metric;
        }
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Epoch seconds at which the event happened.
    #[must_use]
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Seconds the collector should keep the event alive.
    #[must_use]
    pub fn with_ttl(mut self, ttl: f32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tag(tag);
        self
    }

    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
        self
    }

    /// Sets an attribute, replacing any existing value.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    /// Sets every attribute in `attributes`, replacing existing values.
    #[must_use]
    pub fn with_attributes<'a>(mut self, attributes: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self
    }

    /// Adds the attributes this event does not already carry.
    pub fn merge_missing_attributes<I, K, V>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in attributes {
            self.attributes.entry(key.into()).or_insert_with(|| value.into());
        }
    }

    /// Attaches the work item this event is about.
    #[must_use]
    pub fn with_item(mut self, item: Option<WorkItemRef>) -> Self {
        if item.is_some() {
            self.item = item;
        }
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> Option<State> {
        self.state
    }

    #[must_use]
    pub fn metric(&self) -> f64 {
        self.metric
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn time(&self) -> Option<i64> {
        self.time
    }

    #[must_use]
    pub fn ttl(&self) -> Option<f32> {
        self.ttl
    }

    #[must_use]
    pub fn item(&self) -> Option<&WorkItemRef> {
        self.item.as_ref()
    }
}

/// Extra attributes and tags a caller attaches to a latency event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventProperties {
    pub attributes: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl EventProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Folds `other` into `self`; values from `other` win.
    pub fn extend(&mut self, other: EventProperties) {
        self.attributes.extend(other.attributes);
        self.tags.extend(other.tags);
    }
}
