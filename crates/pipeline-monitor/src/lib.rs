// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Pipeline Monitor
//!
//! Latency, throughput and exception telemetry for the components of a
//! stream-processing pipeline.
//!
//! A component reports when it starts working on an item and later whether it
//! succeeded or failed. The [`tracker::Tracker`] keeps the in-flight items in a
//! bounded, time-expiring [`cache::TrackingCache`], turns every close into a
//! latency event and every silent disappearance into an anomaly event, and
//! hands the result to an [`sink::EventSink`].
//!
//! ## Architecture
//!
//! - [`key`]: identity tokens and the composite correlation key
//! - [`item`]: the opaque work item handle supplied by the pipeline
//! - [`record`]: per-item phase timestamps
//! - [`cache`]: the bounded tracking store with removal notifications
//! - [`event`]: event payloads
//! - [`creator`]: strategy turning tracker situations into events
//! - [`tracker`]: the correlation engine
//! - [`interceptor`]: the seam a component wrapper calls into
//! - [`sampling`]: deterministic fractional sampling
//! - [`sink`]: event sinks
//! - [`config`]: configuration loading
//! - [`logger`]: log line formatter

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cache;
pub mod config;
pub mod creator;
pub mod error;
pub mod event;
pub mod interceptor;
pub mod item;
pub mod key;
pub mod logger;
pub mod record;
pub mod sampling;
pub mod sink;
pub mod tracker;

pub use error::{MonitorError, SinkError};
pub use event::{Event, EventProperties};
pub use interceptor::{ComponentInterceptor, OutputInterceptor, OutputInterceptorExt, SourceInterceptor};
pub use item::{Tuple, WorkItem, WorkItemRef};
pub use key::{CorrelationKey, Identity};
pub use sink::EventSink;
pub use tracker::{Outcome, Tracker, TrackerBuilder};
