//! Log line formatting
//!
//! Three prefix styles for stderr logging, selected with `--logformat`:
//! `kernel` emits `<N>` syslog severity prefixes as consumed by the
//! kernel log protocol, `daemon` the same with the daemon facility folded
//! in, and `human` plain severity names.

use clap::ValueEnum;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output prefix style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// `<N>` with N the syslog severity (0..7)
    #[default]
    Kernel,
    /// `<N>` with N carrying the daemon facility (24..31)
    Daemon,
    /// Severity names (`ERR: `, `WARN: `, ...)
    Human,
}

const KERNEL: [&str; 8] = ["<0>", "<1>", "<2>", "<3>", "<4>", "<5>", "<6>", "<7>"];
const DAEMON: [&str; 8] = ["<24>", "<25>", "<26>", "<27>", "<28>", "<29>", "<30>", "<31>"];
const HUMAN: [&str; 8] = [
    "EMERG: ", "ALERT: ", "CRIT: ", "ERR: ", "WARN: ", "NOTICE: ", "INFO: ", "DEBUG: ",
];

/// Syslog severity for a tracing level
fn severity(level: Level) -> usize {
    if level == Level::ERROR {
        3
    } else if level == Level::WARN {
        4
    } else if level == Level::INFO {
        6
    } else {
        7
    }
}

fn prefix(fmt: LogFormat, level: Level) -> &'static str {
    let table = match fmt {
        LogFormat::Kernel => &KERNEL,
        LogFormat::Daemon => &DAEMON,
        LogFormat::Human => &HUMAN,
    };
    table[severity(level)]
}

struct SyslogFormat {
    format: LogFormat,
}

impl<S, N> FormatEvent<S, N> for SyslogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "{}", prefix(self.format, *event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the numeric
/// `--loglevel` filter when present.
pub fn init(loglevel: u8, format: LogFormat) {
    let default_filter = match loglevel {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        7 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(SyslogFormat { format }),
        )
        .init();
}
