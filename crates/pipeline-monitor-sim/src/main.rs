// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use chrono::Utc;
use std::io;
use std::{env, sync::Arc};
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pipeline_monitor::{
    config::MonitorConfig,
    logger::Formatter,
    sink::{LoggingEventSink, StampingSink},
    ComponentInterceptor, OutputInterceptor, Tracker, Tuple, WorkItemRef,
};

const DEFAULT_COMPONENT: &str = "enricher";
const DEFAULT_RATE_PER_SECOND: u64 = 20;
const DEFAULT_RUN_SECONDS: u64 = 30;
// Out of 100 items: how many fail, and how many are never confirmed.
const FAILURE_PERCENT: u32 = 5;
const ABANDON_PERCENT: u32 = 2;

#[tokio::main]
pub async fn main() {
    let config = match MonitorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading pipeline monitor configuration: {e}");
            return;
        }
    };

    let env_filter = config.log_level.clone();

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(Formatter::new())
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let component = env::var("MONITOR_SIM_COMPONENT").unwrap_or_else(|_| DEFAULT_COMPONENT.to_string());
    let rate = env::var("MONITOR_SIM_RATE")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .filter(|rate| *rate > 0)
        .unwrap_or(DEFAULT_RATE_PER_SECOND);
    let run_for = env::var("MONITOR_SIM_RUN_SECONDS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map_or(Duration::from_secs(DEFAULT_RUN_SECONDS), Duration::from_secs);

    let mut sink = StampingSink::new(LoggingEventSink);
    if let Ok(machine_name) = env::var("MONITOR_SIM_MACHINE_NAME") {
        sink = sink.with_machine_name(machine_name);
    }

    let tracker = match Tracker::builder(component.as_str())
        .config(config)
        .sink(sink)
        .build()
    {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            error!("Error creating tracker: {e}");
            return;
        }
    };

    let sweeper = match tracker.spawn_sweeper() {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error starting sweeper: {e}");
            return;
        }
    };

    let cancel_token = CancellationToken::new();
    let workload = tokio::spawn(run_workload(
        ComponentInterceptor::new(Arc::clone(&tracker)),
        rate,
        cancel_token.clone(),
    ));

    info!("Simulating {component} at {rate} items/s for {}s", run_for.as_secs());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
        () = sleep(run_for) => info!("Run finished, shutting down"),
    }

    cancel_token.cancel();
    if let Err(e) = workload.await {
        error!("Workload task failed: {e}");
    }
    if let Err(e) = sweeper.stop().await {
        error!("Error stopping sweeper: {e}");
    }

    tracker.cleanup();
    info!("{} items still in flight", tracker.in_flight());
}

async fn run_workload(interceptor: ComponentInterceptor, rate: u64, cancel_token: CancellationToken) {
    let mut ticker = interval(Duration::from_millis((1000 / rate).max(1)));
    let mut produced: u64 = 0;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                produced += 1;
                let item = Tuple::new("kafka-spout", "orders")
                    .with_field("orderId", produced)
                    .with_field("_queueTime", Utc::now().timestamp_millis())
                    .into_ref();
                tokio::spawn(process(interceptor.clone(), item));
            }
        }
    }

    debug!("Workload produced {} items", produced);
}

async fn process(interceptor: ComponentInterceptor, item: WorkItemRef) {
    interceptor.on_start(&item);
    sleep(Duration::from_millis(fastrand::u64(1..40))).await;

    let anchors = std::slice::from_ref(&item);
    interceptor.on_emit_start(anchors);
    sleep(Duration::from_millis(fastrand::u64(0..10))).await;
    interceptor.on_emit_end(anchors);
    interceptor.tracker().record_throughput(Some(&item));

    let roll = fastrand::u32(0..100);
    if roll < ABANDON_PERCENT {
        warn!("Dropping item without confirmation");
    } else if roll < ABANDON_PERCENT + FAILURE_PERCENT {
        let error = io::Error::new(io::ErrorKind::TimedOut, "downstream timed out");
        interceptor.on_error(&error);
        interceptor.on_fail(&item, &error.to_string());
    } else {
        interceptor.on_ack(&item);
    }
}
