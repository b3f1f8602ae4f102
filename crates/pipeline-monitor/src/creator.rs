// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strategy turning tracker situations into events.
//!
//! Every method returns zero or more events so an implementation can suppress
//! a situation entirely or fan it out into several payloads.

use crate::cache::{RemovalCause, RemovalNotification};
use crate::event::{Event, EventProperties, Outcome};
use crate::item::WorkItemRef;
use crate::key::CorrelationKey;
use crate::record::LatencyRecord;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const MISSING_KEY_TAG: &str = "latency-missing-key";
pub const UNEXPECTED_REMOVE_KEY_TAG: &str = "latency-unexpectedly-removed";
pub const DOUBLE_COMPLETION_TAG: &str = "double-completion";
pub const EMIT_LATENCY_TAG: &str = "emit-latency";
pub const PII_TAG: &str = "pii";

pub const START_TIME_ATTR: &str = "startTime";
pub const START_TIME_MILLIS_ATTR: &str = "startTimeMillis";
pub const REMOVAL_CAUSE_ATTR: &str = "removalCause";
pub const RECEIVED_FROM_ATTR: &str = "receivedFrom";
pub const ITEM_ATTR: &str = "tuple";
pub const KEY_ATTR: &str = "key";
pub const ERROR_ATTR: &str = "error";

const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Builds the events the tracker sends.
pub trait EventCreator: Send + Sync {
    /// Events for a record that left the cache without being closed.
    fn expiry_removal_events(
        &self,
        notification: &RemovalNotification<CorrelationKey, LatencyRecord>,
        component: &str,
    ) -> Vec<Event>;

    /// Events for a close on a key the tracker does not know.
    fn missing_key_events(&self, service: &str, key: &CorrelationKey) -> Vec<Event>;

    /// Events for a second close of an already completed record.
    fn double_completion_events(&self, service: &str, key: &CorrelationKey) -> Vec<Event>;

    /// Events for a primary phase closed after `elapsed`, ending at `ended_at`.
    fn latency_events(
        &self,
        outcome: &Outcome,
        record: &LatencyRecord,
        ended_at: DateTime<Utc>,
        elapsed: Duration,
        properties: Option<&EventProperties>,
    ) -> Vec<Event>;

    /// Events for the time spent handing an item downstream.
    fn emit_latency_events(
        &self,
        elapsed: Duration,
        component: &str,
        item: Option<&WorkItemRef>,
    ) -> Vec<Event>;

    /// Events describing a failed outcome nobody measured.
    fn error_events(&self, reason: &str, component: &str) -> Vec<Event>;
}

/// The stock event shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEventCreator;

fn millis(duration: Duration) -> f64 {
    duration.as_millis() as f64
}

impl EventCreator for DefaultEventCreator {
    fn expiry_removal_events(
        &self,
        notification: &RemovalNotification<CorrelationKey, LatencyRecord>,
        component: &str,
    ) -> Vec<Event> {
        let record = &notification.value;
        let service = if record.service().is_empty() {
            component
        } else {
            record.service()
        };

        let mut event = Event::exception("Latency object unexpectedly removed")
            .with_attribute(REMOVAL_CAUSE_ATTR, notification.cause)
            .with_attribute(KEY_ATTR, notification.key)
            .with_tag(UNEXPECTED_REMOVE_KEY_TAG)
            .with_service(service);

        if let Some(item) = record.item() {
            event = event.with_attribute(RECEIVED_FROM_ATTR, item.source_component());
            if notification.cause == RemovalCause::Expired {
                event = event
                    .with_attribute(ITEM_ATTR, item.describe())
                    .with_tag(PII_TAG);
            }
        }

        vec![event]
    }

    fn missing_key_events(&self, service: &str, key: &CorrelationKey) -> Vec<Event> {
        vec![Event::exception("Latency monitor doesn't recognize key.")
            .with_tag(MISSING_KEY_TAG)
            .with_service(service)
            .with_attribute(KEY_ATTR, key)]
    }

    fn double_completion_events(&self, service: &str, key: &CorrelationKey) -> Vec<Event> {
        vec![Event::exception("Latency monitor received a second completion for key.")
            .with_tag(DOUBLE_COMPLETION_TAG)
            .with_service(service)
            .with_attribute(KEY_ATTR, key)]
    }

    fn latency_events(
        &self,
        outcome: &Outcome,
        record: &LatencyRecord,
        ended_at: DateTime<Utc>,
        elapsed: Duration,
        properties: Option<&EventProperties>,
    ) -> Vec<Event> {
        let started_at = chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|elapsed| ended_at.checked_sub_signed(elapsed))
            .unwrap_or(ended_at);

        let mut event = Event::latency(millis(elapsed), record.service())
            .with_state(outcome.state())
            .with_item(record.item().cloned());

        if let Outcome::Failure(reason) = outcome {
            event = event.with_attribute(ERROR_ATTR, reason);
        }

        if let Some(properties) = properties {
            event = event
                .with_attributes(&properties.attributes)
                .with_tags(properties.tags.iter().cloned());
        }

        vec![event
            .with_attribute(START_TIME_ATTR, started_at.format(START_TIME_FORMAT))
            .with_attribute(START_TIME_MILLIS_ATTR, started_at.timestamp_millis())]
    }

    fn emit_latency_events(
        &self,
        elapsed: Duration,
        component: &str,
        item: Option<&WorkItemRef>,
    ) -> Vec<Event> {
        vec![Event::latency(millis(elapsed), component)
            .with_tag(EMIT_LATENCY_TAG)
            .with_service(format!("{component} emit latency."))
            .with_item(item.cloned())]
    }

    fn error_events(&self, reason: &str, component: &str) -> Vec<Event> {
        vec![Event::exception(reason).with_service(component)]
    }
}
