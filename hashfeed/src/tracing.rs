//! Logging setup for the hashfeed daemon.
//!
//! Call one of the `init_*` functions once at startup. Everything else in the
//! crate pulls in `use crate::tracing::prelude::*` and logs with structured
//! fields, e.g. `info!(source = %name, jobs = n, "Fetched jobs")`.

use std::env;
use std::fmt::Write as _;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Filter directives are read from this variable, falling back to `RUST_LOG`.
const FILTER_VAR: &str = "HASHFEED_LOG";

/// Install journald logging when started by systemd, stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_err() {
        init_stdout();
        return;
    }

    match tracing_journald::layer() {
        Ok(layer) => tracing_subscriber::registry()
            .with(env_filter())
            .with(layer)
            .init(),
        Err(e) => {
            init_stdout();
            error!(error = %e, "Failed to initialize journald logging, using stdout.");
        }
    }
}

/// Install the human-readable stdout subscriber.
pub fn init_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(EventLine),
        )
        .init();
}

// INFO unless overridden.
fn env_filter() -> EnvFilter {
    let var = if env::var(FILTER_VAR).is_ok() {
        FILTER_VAR
    } else {
        "RUST_LOG"
    };

    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(var)
        .from_env_lossy()
}

/// One event per line, with structured fields dimmed on a continuation line.
struct EventLine;

#[derive(Default)]
struct Fields {
    message: Option<String>,
    pairs: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for Fields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.pairs.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
            return;
        }

        // Some(x) -> x
        let text = match text.strip_prefix("Some(").and_then(|t| t.strip_suffix(')')) {
            Some(inner) => inner.to_string(),
            None => text,
        };
        self.pairs.push((field.name(), text));
    }
}

/// Shorten a target for display. Our own modules lose the crate prefix and
/// events bridged from `log` use their original target.
fn display_target<'a>(target: &'a str, fields: &'a Fields) -> &'a str {
    if let Some(stripped) = target.strip_prefix("hashfeed::") {
        return stripped;
    }
    if target == "log" {
        if let Some((_, v)) = fields.pairs.iter().find(|(k, _)| *k == "log.target") {
            return v.trim_matches('"');
        }
    }
    target
}

fn level_style(level: tracing::Level) -> (&'static str, &'static str) {
    match level {
        tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
        tracing::Level::WARN => ("\x1b[33m", "WARN "),
        tracing::Level::INFO => ("\x1b[32m", "INFO "),
        tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
        tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for EventLine
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;
        let (color, label) = level_style(*event.metadata().level());
        write!(writer, " {}{}\x1b[0m ", color, label)?;
        write!(
            writer,
            "{}: ",
            display_target(event.metadata().target(), &fields)
        )?;

        if let Some(message) = &fields.message {
            write!(writer, "{}", message.trim_matches('"'))?;
        }

        let mut extra = String::new();
        for (key, value) in fields.pairs.iter().filter(|(k, _)| !k.starts_with("log.")) {
            if !extra.is_empty() {
                extra.push_str(", ");
            }
            let _ = write!(extra, "{}={}", key, value.trim_matches('"'));
        }
        if !extra.is_empty() {
            // Align under the target column: "HH:MM:SS LEVEL "
            write!(writer, "\n\x1b[90m{:15}{}\x1b[0m", "", extra)?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_targets_are_shortened() {
        let fields = Fields::default();
        assert_eq!(
            display_target("hashfeed::work_queue", &fields),
            "work_queue"
        );
        assert_eq!(display_target("tokio::runtime", &fields), "tokio::runtime");
    }

    #[test]
    fn test_log_bridge_uses_original_target() {
        let fields = Fields {
            message: None,
            pairs: vec![("log.target", "\"mio::poll\"".to_string())],
        };
        assert_eq!(display_target("log", &fields), "mio::poll");
    }
}
