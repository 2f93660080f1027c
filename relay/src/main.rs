//! Main entry point and command line interface for the relay binary.
//!
//! Relay is a standalone store-and-forward proxy for event ingestion. It accepts events on
//! behalf of an upstream server, validates them against per-project configuration, and forwards
//! accepted events in batches.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            relay_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
