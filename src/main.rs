use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use jsonlog_reader::{
    Error, LogWatcher, Message, ReadConfig, ReaderOptions, Tail, watch_log_with_options,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

/// Print the records of a rotated JSON-lines log.
#[derive(Parser, Debug)]
#[command(name = "jsonlog-tail", version, about = "Tail rotated JSON-lines logs")]
struct Args {
    /// Path of the active log file
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// Lines of history to print: 0 for none, negative for everything
    #[arg(short = 'n', long = "tail", default_value_t = -1, allow_negative_numbers = true)]
    tail: i64,

    /// Only print records stamped at or after this RFC3339 instant
    #[arg(long = "since", value_parser = parse_since)]
    since: Option<DateTime<Utc>>,

    /// Keep printing records as they are written (like tail -f)
    #[arg(short = 'f', long = "follow")]
    follow: bool,

    /// Number of retained files, counting the active one
    #[arg(long = "max-files", default_value_t = 1)]
    max_files: usize,

    /// Upper bound between checks of the file while following
    #[arg(long = "poll-interval-ms", default_value_t = 100)]
    poll_interval_ms: u64,

    /// Enable debug logging on stderr
    #[arg(long = "debug")]
    debug: bool,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC3339 timestamp: {e}"))
}

/// Priority: RUST_LOG > --debug > "warn".
fn init_logging(debug_flag: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if debug_flag {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_message(out: &mut impl Write, message: &Message) -> io::Result<()> {
    write!(
        out,
        "{} {} ",
        message.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        message.source
    )?;
    out.write_all(&message.line)?;
    if !message.line.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Errors after which the request has stopped for good.
fn is_fatal(error: &Error) -> bool {
    matches!(error, Error::OpenActive { .. } | Error::Decode(_) | Error::Io(_))
}

/// Log every error reported so far. Returns whether any was fatal.
fn report_errors(watcher: &mut LogWatcher) -> bool {
    let mut fatal = false;
    while let Some(e) = watcher.try_next_error() {
        if is_fatal(&e) {
            fatal = true;
            error!(error = %e, "Read failed");
        } else {
            warn!(error = %e, "Read error");
        }
    }
    fatal
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let config = ReadConfig {
        tail: Tail::from(args.tail),
        since: args.since,
        follow: args.follow,
    };
    let options = ReaderOptions {
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        ..Default::default()
    };
    debug!(path = %args.path.display(), ?config, "Starting read");

    let mut watcher = match watch_log_with_options(&args.path, args.max_files, config, options) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(path = %args.path.display(), error = %e, "Failed to set up log watch");
            process::exit(1);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut failed = false;
    let mut interrupted = false;

    loop {
        tokio::select! {
            message = watcher.next_message() => match message {
                Some(message) => {
                    if let Err(e) = print_message(&mut out, &message) {
                        debug!(error = %e, "Output closed");
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                debug!("Interrupted, flushing");
                interrupted = true;
                watcher.close();
            }
        }
        failed |= report_errors(&mut watcher);
    }
    failed |= report_errors(&mut watcher);

    if failed {
        process::exit(1);
    }
}
