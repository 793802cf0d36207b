//! Console log format for the mesh node.
//!
//! Lines look like `[timestamp] [service] [level] message`. The service
//! column shows `mesh` or, for events carrying a `component` field,
//! `mesh-<component>`.

use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

mod ansi {
    pub const RESET: &str = "\x1b[0m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[93m";
    pub const RED: &str = "\x1b[91m";
    pub const GRAY: &str = "\x1b[90m";
}

const SERVICE_COLUMN: usize = 20;
const LEVEL_COLUMN: usize = 9;

/// Log at info, tagged with the component shown in the service column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn, tagged with the component shown in the service column
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Event formatter installed by the binary
pub struct MeshLogFormatter {
    service: String,
    colors: bool,
}

impl MeshLogFormatter {
    pub fn new(service: String) -> Self {
        let colors = std::env::var("TERM").map_or(false, |term| term != "dumb")
            && std::io::stderr().is_terminal();
        Self { service, colors }
    }

    #[cfg(test)]
    fn plain(service: &str) -> Self {
        Self {
            service: service.to_string(),
            colors: false,
        }
    }

    fn service_column(&self, component: Option<&str>) -> String {
        let name = component.map_or_else(
            || self.service.clone(),
            |component| format!("{}-{}", self.service, component),
        );

        if name.chars().count() <= SERVICE_COLUMN {
            return format!("{:<SERVICE_COLUMN$}", name);
        }
        let mut short: String = name.chars().take(SERVICE_COLUMN - 1).collect();
        short.push('…');
        short
    }

    /// Label and colour for a level
    fn level_style(&self, level: &Level) -> (&'static str, &'static str) {
        let (label, color) = match *level {
            Level::ERROR => ("✗ ERROR", ansi::RED),
            Level::WARN => ("⚠ WARN", ansi::YELLOW),
            Level::INFO => ("ℹ INFO", ansi::GREEN),
            Level::DEBUG => ("◦ DEBUG", ansi::GRAY),
            Level::TRACE => ("◦ TRACE", ansi::GRAY),
        };
        (label, if self.colors { color } else { "" })
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let (label, color) = self.level_style(event.metadata().level());
        let (cyan, reset) = if self.colors {
            (ansi::CYAN, ansi::RESET)
        } else {
            ("", "")
        };

        writeln!(
            writer,
            "{cyan}[{}] [{}] [{color}{:<LEVEL_COLUMN$}{reset}] {}{reset}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.service_column(fields.component.as_deref()),
            label,
            fields.message,
        )
    }
}

/// The `message` and `component` fields of one event
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }
}
