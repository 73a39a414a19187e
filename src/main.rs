use std::io;
use std::time::Duration;

use clap::Parser;
use env_logger::Builder;
use log::{error, LevelFilter};

use vmplace::core::clock::MonotonicClock;
use vmplace::protocol::{run_session, SessionOptions};

/// Online VM placement engine speaking the line protocol on stdin/stdout.
#[derive(Parser)]
#[command(name = "vmplace")]
struct Args {
    /// Wall-clock budget for the whole session, in seconds. Creation requests
    /// arriving after the budget is spent are rejected.
    #[arg(long, default_value_t = 14.0)]
    time_budget: f64,

    /// Log verbosity, written to stderr.
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

fn main() {
    let args = Args::parse();
    Builder::new().filter_level(args.log_level).init();

    let options = SessionOptions {
        time_budget: Duration::from_secs_f64(args.time_budget),
        clock: Box::new(MonotonicClock::new()),
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    if let Err(e) = run_session(stdin.lock(), stdout.lock(), options) {
        // The client protocol has no error channel; report and exit cleanly.
        error!("session aborted: {}", e);
    }
}
