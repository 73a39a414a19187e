use std::io::Cursor;
use std::time::Duration;

use vmplace::core::clock::ManualClock;
use vmplace::protocol::{run_session, SessionOptions};

const PREAMBLE: &str = "2 2 2 2\n10 10\n10 10\n2\n1 4 4\n2 6 6\n";

fn run(input: String, clock: ManualClock) -> String {
    let mut output = Vec::new();
    let options = SessionOptions {
        time_budget: Duration::from_secs(14),
        clock: Box::new(clock),
    };
    run_session(Cursor::new(input), &mut output, options).unwrap();
    String::from_utf8(output).unwrap()
}

#[test]
// A full session: declare a PG, place one VM on the first node, delete it,
// shut down.
fn test_full_session() {
    let input = format!("{}1 1 0 0 0 0\n2 1 1 1 0 1\n3 1 1\n4\n", PREAMBLE);
    let output = run(input, ManualClock::new());
    assert_eq!(output, "1 1 1 1\n");
}

#[test]
// A batch answer carries one line per VM, in input id order.
fn test_batch_output_order() {
    let input = format!("{}1 2 0 0 0 2\n2 2 1 2 0 7 8\n4\n", PREAMBLE);
    let output = run(input, ManualClock::new());
    assert_eq!(output, "1 1 1 1\n1 1 1 2\n");
}

#[test]
// An infeasible creation answers -1 and ends the session; later requests are
// not processed.
fn test_infeasible_creation_terminates() {
    // Nine two-node VMs exceed the whole fabric's capacity of eight.
    let input = format!("{}1 1 0 0 0 0\n2 9 2 1 0 1 2 3 4 5 6 7 8 9\n2 1 1 1 0 10\n4\n", PREAMBLE);
    let output = run(input, ManualClock::new());
    assert_eq!(output, "-1\n");
}

#[test]
// A session past its time budget rejects the next creation outright.
fn test_time_budget_rejection() {
    let clock = ManualClock::new();
    clock.set(Duration::from_secs(15));
    let input = format!("{}1 1 0 0 0 0\n2 1 1 1 0 1\n4\n", PREAMBLE);
    let output = run(input, clock);
    assert_eq!(output, "-1\n");
}

#[test]
// End of input without a shutdown record is treated as an orderly shutdown.
fn test_eof_is_shutdown() {
    let output = run(PREAMBLE.to_string(), ManualClock::new());
    assert_eq!(output, "");
}

#[test]
// Unknown request tags are fatal protocol errors.
fn test_unknown_tag_is_error() {
    let input = format!("{}9\n", PREAMBLE);
    let mut output = Vec::new();
    let result = run_session(
        Cursor::new(input),
        &mut output,
        SessionOptions {
            time_budget: Duration::from_secs(14),
            clock: Box::new(ManualClock::new()),
        },
    );
    assert!(result.is_err());
}
