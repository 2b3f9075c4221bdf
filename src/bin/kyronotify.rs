//! kyronotify CLI
//!
//! Watches one or more paths and prints every event until all watches are
//! gone, the stream ends, or Ctrl-C is pressed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use kyronotify::{Event, EventMask, Notifier, NotifierConfig, NotifyResult, ReaderExit, Watch};

/// Print filesystem events for the given paths.
#[derive(Debug, Parser)]
#[command(name = "kyronotify", version, about)]
struct Cli {
    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "warn", env = "KYRONOTIFY_LOG_LEVEL")]
    log_level: String,

    /// Print one JSON object per event.
    #[arg(long)]
    json: bool,

    /// Events buffered before new ones are dropped.
    #[arg(long, default_value_t = NotifierConfig::default().queue_capacity)]
    queue_capacity: usize,

    /// Comma-separated event names, or "all".
    #[arg(long, default_value = "all")]
    events: EventMask,

    /// Paths to watch.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn init_logging(level: &str) {
    // RUST_LOG env var takes precedence over --log-level
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}

fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode event"),
        }
    } else {
        println!("{event}");
    }
}

async fn run(cli: Cli) -> NotifyResult<()> {
    let cfg = NotifierConfig {
        queue_capacity: cli.queue_capacity,
        ..NotifierConfig::default()
    };
    let notifier = Notifier::open(cfg)?;

    let mut watches: Vec<Watch> = Vec::with_capacity(cli.paths.len());
    for path in cli.paths {
        match notifier.add_watch(path.clone(), cli.events) {
            Ok(watch) => watches.push(watch),
            Err(e) => error!(path = %path.display(), error = %e, "cannot watch path"),
        }
    }
    if watches.is_empty() {
        notifier.close();
        return Err(kyronotify::NotifyError::invalid_argument("no path could be watched"));
    }
    info!(count = watches.len(), events = %cli.events, "watching");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            next = notifier.next() => {
                let Some(event) = next else { break };
                print_event(&event, cli.json);
                if event.is_ignored() {
                    watches.retain(|w| !w.is_closed());
                    if watches.is_empty() {
                        info!("no watches left");
                        break;
                    }
                }
            }
        }
    }

    drop(watches);
    let dropped = notifier.dropped_events();
    if dropped > 0 {
        warn!(dropped, "events were dropped because the queue was full");
    }
    match notifier.shutdown().await? {
        ReaderExit::Eof => info!("inotify handle reached end of stream"),
        ReaderExit::Cancelled => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
