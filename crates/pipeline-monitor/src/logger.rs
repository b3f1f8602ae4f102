// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatter for processes embedding the monitor.
//!
//! Lines look like:
//!
//! ```text
//! PIPELINE_MONITOR | WARN | sweep{component="enricher"}: enricher doesn't recognize #3/#9
//! ```

use std::fmt::{self, Write as _};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

const DEFAULT_PREFIX: &str = "PIPELINE_MONITOR";
const SPAN_SEPARATOR: &str = " > ";

/// Writes `PREFIX | LEVEL | outer{..} > inner{..}: message fields`.
///
/// Spans are joined root first; lines outside any span skip that segment.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Formatter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX,
        }
    }

    /// Replaces `PIPELINE_MONITOR` with `prefix`, e.g. to tell embedding
    /// processes apart in a shared log stream.
    #[must_use]
    pub const fn with_prefix(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{} | {} | ", self.prefix, event.metadata().level())?;

        let mut context = String::new();
        for span in ctx.event_scope().into_iter().flat_map(|scope| scope.from_root()) {
            if !context.is_empty() {
                context.push_str(SPAN_SEPARATOR);
            }
            context.push_str(span.name());
            match span.extensions().get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => write!(context, "{{{fields}}}")?,
                _ => {}
            }
        }
        if !context.is_empty() {
            write!(writer, "{context}: ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span, warn};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(formatter: Formatter, f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(formatter)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_prefix_and_level() {
        let output = capture(Formatter::new(), || info!("tracker started"));
        assert_eq!(output, "PIPELINE_MONITOR | INFO | tracker started\n");
    }

    #[test]
    fn test_span_context() {
        let output = capture(Formatter::default(), || {
            let span = info_span!("sweep", component = "enricher");
            let _entered = span.enter();
            warn!("expired {}", 3);
        });
        assert_eq!(
            output,
            "PIPELINE_MONITOR | WARN | sweep{component=\"enricher\"}: expired 3\n"
        );
    }

    #[test]
    fn test_nested_spans_and_custom_prefix() {
        let output = capture(Formatter::with_prefix("ORDERS"), || {
            let outer = info_span!("tracker", component = "enricher");
            let _outer = outer.enter();
            let inner = info_span!("close");
            let _inner = inner.enter();
            info!(key = "#1/#2", "latency reported");
        });
        assert_eq!(
            output,
            "ORDERS | INFO | tracker{component=\"enricher\"} > close: latency reported key=\"#1/#2\"\n"
        );
    }
}
