use std::io::IsTerminal;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Targets that follow `--log-level`. Everything else stays at warn or
/// quieter so tokio internals do not drown out the bus traffic.
const BUS_TARGETS: [&str; 4] = [
    "snodebus",
    "snodebus_transport",
    "snodebus_frame",
    "snodebus_session",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// Debug and trace output names the layer each line came from.
    fn shows_target(self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Trace)
    }

    /// At trace, every span logs its busy and idle time when it closes.
    fn span_events(self) -> FmtSpan {
        match self {
            LogLevel::Trace => FmtSpan::CLOSE,
            _ => FmtSpan::NONE,
        }
    }
}

/// Per-target filter: the bus crates at `level`, dependencies at most warn.
pub fn filter(level: LogLevel) -> Targets {
    let level = level.as_filter();
    BUS_TARGETS
        .iter()
        .fold(Targets::new(), |targets, target| {
            targets.with_target(*target, level)
        })
        .with_default(level.min(LevelFilter::WARN))
}

/// Log to stderr; stdout carries command output only.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(level.shows_target())
        .with_span_events(level.span_events());
    let registry = tracing_subscriber::registry().with(filter(level));

    let _ = match format {
        LogFormat::Text => registry
            .with(layer.with_ansi(std::io::stderr().is_terminal()))
            .try_init(),
        LogFormat::Json => registry.with(layer.with_ansi(false).json()).try_init(),
    };
}
