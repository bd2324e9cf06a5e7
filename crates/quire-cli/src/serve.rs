//! JSON-lines service: one request per input line, one reply per output line.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use quire::Engine;
use quire::rpc;

/// Serve requests from stdin until it closes.
///
/// # Errors
/// Fails when stdin or stdout does.
pub fn run(engine: &Engine) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    tracing::info!("serving JSON requests on stdin");
    let mut served = 0_u64;
    for line in stdin.lock().lines() {
        let line = line.context("could not read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = rpc::handle_json(engine, &line);
        serde_json::to_writer(&mut stdout, &reply).context("could not write reply")?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
        served += 1;
    }
    tracing::info!(served, "stdin closed");
    Ok(())
}
