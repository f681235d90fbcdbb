//! Per-controller outcome reporting

use std::io::{self, Write};

use colored::Colorize;

use crate::cluster::ControllerTarget;
use crate::restart::RestartError;

/// Result of one restart attempt
#[derive(Debug)]
pub struct Outcome {
    pub target: ControllerTarget,
    /// Marker written on success
    pub result: Result<String, RestartError>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Receives outcomes in the order targets were emitted
pub trait OutcomeSink {
    fn record(&mut self, outcome: &Outcome);
}

/// Counts for a finished batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn add(&mut self, outcome: &Outcome) {
        self.attempted += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Writes one line per outcome: successes to `out`, failures to `err`
///
/// Each stream carries its own colour flag since either may be redirected
/// while the other stays on a terminal.
pub struct ConsoleReporter<O, E> {
    out: O,
    err: E,
    color_out: bool,
    color_err: bool,
}

impl ConsoleReporter<io::Stdout, io::Stderr> {
    pub fn stdio(color_out: bool, color_err: bool) -> Self {
        Self::new(io::stdout(), io::stderr(), color_out, color_err)
    }
}

impl<O: Write, E: Write> ConsoleReporter<O, E> {
    pub fn new(out: O, err: E, color_out: bool, color_err: bool) -> Self {
        Self {
            out,
            err,
            color_out,
            color_err,
        }
    }

    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }
}

impl<O: Write, E: Write> OutcomeSink for ConsoleReporter<O, E> {
    fn record(&mut self, outcome: &Outcome) {
        let target = &outcome.target;

        // A closed stdout/stderr must not stop the batch.
        let _ = match &outcome.result {
            Ok(_) => {
                let line = format!("Successfully restarted {} {}", target.kind, target.name);
                if self.color_out {
                    writeln!(self.out, "{} {}", "✓".green().bold(), line)
                } else {
                    writeln!(self.out, "{}", line)
                }
            }
            Err(e) => {
                let line = format!("Error restarting {} {}: {}", target.kind, target.name, e);
                if self.color_err {
                    writeln!(self.err, "{} {}", "✗".red().bold(), line)
                } else {
                    writeln!(self.err, "{}", line)
                }
            }
        };
    }
}
