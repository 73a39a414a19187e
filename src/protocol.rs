//! Line-oriented request/response transcoding.
//!
//! The session preamble describes the fabric and the VM type catalog; every
//! following record is a tagged request. Responses are written and flushed
//! per request so the engine can be driven interactively.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::time::Duration;

use log::info;

use crate::core::clock::{Clock, MonotonicClock};
use crate::core::common::{Affinity, VmType};
use crate::core::error::SessionError;
use crate::core::resource_tree::ResourceTree;
use crate::core::scheduler::{CreateVerdict, Scheduler};

/// Session-level knobs supplied by the entry point.
pub struct SessionOptions {
    pub time_budget: Duration,
    pub clock: Box<dyn Clock>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            time_budget: Scheduler::DEFAULT_TIME_BUDGET,
            clock: Box::new(MonotonicClock::new()),
        }
    }
}

/// Runs one full session: preamble, request loop, shutdown. Returns an error
/// only for fatal protocol violations; ordinary rejections are reported to
/// the client as `-1` and end the session cleanly.
pub fn run_session<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    options: SessionOptions,
) -> Result<(), SessionError> {
    let mut tokens = TokenReader::new(input);

    let domain_count: usize = tokens.next()?;
    let racks_per_domain: usize = tokens.next()?;
    let pms_per_rack: usize = tokens.next()?;
    let nodes_per_pm: usize = tokens.next()?;

    let mut node_caps = Vec::with_capacity(nodes_per_pm);
    for _ in 0..nodes_per_pm {
        let cpu: u64 = tokens.next()?;
        let memory: u64 = tokens.next()?;
        node_caps.push((cpu, memory));
    }

    let type_count: usize = tokens.next()?;
    let mut types = Vec::with_capacity(type_count);
    for i in 0..type_count {
        types.push(VmType {
            index: i + 1,
            nodes_required: tokens.next()?,
            cpu_per_node: tokens.next()?,
            memory_per_node: tokens.next()?,
        });
    }

    info!(
        "session start: {} domains x {} racks x {} pms x {} nodes, {} vm types",
        domain_count, racks_per_domain, pms_per_rack, nodes_per_pm, type_count
    );

    let tree = ResourceTree::new(domain_count, racks_per_domain, pms_per_rack, &node_caps);
    let mut scheduler = Scheduler::new(tree, types, options.clock, options.time_budget);

    loop {
        // End of input counts as an orderly shutdown.
        let Some(tag) = tokens.try_next::<u32>()? else {
            break;
        };
        match tag {
            1 => {
                let id = tokens.next()?;
                let hard_rack_partitions = tokens.next()?;
                let soft_pm_anti_affinity = tokens.next()?;
                let domain_affinity = read_affinity(&mut tokens)?;
                let rack_affinity = read_affinity(&mut tokens)?;
                scheduler.create_pg(id, hard_rack_partitions, soft_pm_anti_affinity, domain_affinity, rack_affinity);
            }
            2 => {
                let count: usize = tokens.next()?;
                let type_index = tokens.next()?;
                let pg_id = tokens.next()?;
                let partition: i64 = tokens.next()?;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(tokens.next()?);
                }
                match scheduler.create_vms(&ids, type_index, pg_id, partition)? {
                    CreateVerdict::Placed(assignments) => {
                        for assignment in assignments {
                            writeln!(output, "{}", assignment)?;
                        }
                        output.flush()?;
                    }
                    CreateVerdict::Infeasible | CreateVerdict::TimedOut => {
                        writeln!(output, "-1")?;
                        output.flush()?;
                        break;
                    }
                }
            }
            3 => {
                let count: usize = tokens.next()?;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(tokens.next()?);
                }
                scheduler.delete_vms(&ids)?;
            }
            4 => break,
            other => {
                return Err(SessionError::MalformedRequest(format!(
                    "unknown request tag {}",
                    other
                )));
            }
        }
    }

    info!(
        "session finished: {}",
        serde_json::to_string(scheduler.stats()).unwrap_or_default()
    );
    Ok(())
}

fn read_affinity<R: BufRead>(tokens: &mut TokenReader<R>) -> Result<Affinity, SessionError> {
    let code: u32 = tokens.next()?;
    Affinity::from_code(code)
        .ok_or_else(|| SessionError::MalformedRequest(format!("invalid affinity code {}", code)))
}

/// Whitespace-separated token stream over a buffered reader, pulling lines
/// lazily so requests can be answered before the input is closed.
struct TokenReader<R> {
    input: R,
    pending: VecDeque<String>,
}

impl<R: BufRead> TokenReader<R> {
    fn new(input: R) -> Self {
        Self {
            input,
            pending: VecDeque::new(),
        }
    }

    fn next_token(&mut self) -> Result<Option<String>, SessionError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.pending
                .extend(line.split_ascii_whitespace().map(str::to_owned));
        }
    }

    fn next<T: FromStr>(&mut self) -> Result<T, SessionError> {
        match self.next_token()? {
            Some(token) => token
                .parse()
                .map_err(|_| SessionError::MalformedRequest(format!("invalid token '{}'", token))),
            None => Err(SessionError::MalformedRequest("unexpected end of input".to_string())),
        }
    }

    fn try_next<T: FromStr>(&mut self) -> Result<Option<T>, SessionError> {
        match self.next_token()? {
            Some(token) => token
                .parse()
                .map(Some)
                .map_err(|_| SessionError::MalformedRequest(format!("invalid token '{}'", token))),
            None => Ok(None),
        }
    }
}
