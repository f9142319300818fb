// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::io;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logship_engine::config::EngineConfig;
use logship_engine::logger::Formatter;
use logship_engine::sink::registry;
use logship_engine::{Accepted, Batch, Engine, Record};

const ENV_PREFIX: &str = "LOGSHIP_";
const KEY_BATCH_SIZE: &str = "batch_size";
const DEFAULT_BATCH_SIZE: usize = 100;

#[tokio::main]
pub async fn main() -> Result<()> {
    let log_level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");

    let options = options_from_env(env::vars());
    let batch_size = batch_size(&options)?;
    let sink = registry::build(&options).context("invalid sink configuration")?;
    let config = EngineConfig::from_options(&options).context("invalid engine configuration")?;
    let engine = Engine::start(config, sink).context("could not start the engine")?;

    let input = BufReader::new(tokio::io::stdin());
    let result = forward(&engine, input, batch_size, tokio::signal::ctrl_c()).await;
    if let Err(e) = &result {
        error!("AGENT | Stopped reading input: {e:#}");
    }

    engine.shutdown().await.context("engine shutdown failed")?;
    let stats = engine.stats();
    info!(
        "AGENT | Done: {} submitted, {} sent directly, {} queued, {} acked, {} dead-lettered, {} left in queue",
        stats.submitted,
        stats.sent_directly,
        stats.queued,
        stats.acked,
        stats.dead_lettered,
        stats.queue_depth
    );
    result
}

/// Maps every `LOGSHIP_<KEY>` variable to option `<key>`.
fn options_from_env(vars: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.into_iter()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(ENV_PREFIX)?;
            (!key.is_empty()).then(|| (key.to_lowercase(), value))
        })
        .collect()
}

fn batch_size(options: &HashMap<String, String>) -> Result<usize> {
    let Some(raw) = options.get(KEY_BATCH_SIZE).map(|v| v.trim()) else {
        return Ok(DEFAULT_BATCH_SIZE);
    };
    match raw.parse::<usize>() {
        Ok(0) | Err(_) => bail!("{KEY_BATCH_SIZE} must be a positive integer, got {raw:?}"),
        Ok(size) => Ok(size),
    }
}

/// Parses one input line. Blank lines and lines that are not JSON objects yield `None`.
fn parse_record(line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Record>(line) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("AGENT | Skipping input line that is not a JSON object: {e}");
            None
        }
    }
}

/// Reads records from `input` until EOF or `interrupted` resolves, submitting a batch every
/// `batch_size` records.
///
/// A submit still waiting on a full queue when `interrupted` resolves is abandoned; its records
/// were never accepted by the engine.
async fn forward<R, S>(engine: &Engine, input: R, batch_size: usize, interrupted: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = io::Result<()>>,
{
    let mut lines = input.lines();
    let mut pending: Vec<Record> = Vec::with_capacity(batch_size);
    tokio::pin!(interrupted);

    loop {
        let line = tokio::select! {
            signal = &mut interrupted => return on_interrupt(signal, pending.len()),
            line = lines.next_line() => line.context("could not read input")?,
        };
        let Some(line) = line else {
            debug!("AGENT | End of input");
            break;
        };
        if let Some(record) = parse_record(&line) {
            pending.push(record);
        }
        if pending.len() >= batch_size {
            let records = std::mem::take(&mut pending);
            let count = records.len();
            tokio::select! {
                signal = &mut interrupted => return on_interrupt(signal, count),
                result = submit(engine, records) => result?,
            }
        }
    }

    if !pending.is_empty() {
        let count = pending.len();
        tokio::select! {
            signal = &mut interrupted => return on_interrupt(signal, count),
            result = submit(engine, pending) => result?,
        }
    }
    Ok(())
}

fn on_interrupt(signal: io::Result<()>, unsubmitted: usize) -> Result<()> {
    signal.context("could not listen for Ctrl-C")?;
    info!("AGENT | Interrupted, shutting down");
    if unsubmitted > 0 {
        warn!("AGENT | Dropping {unsubmitted} records the engine had not accepted");
    }
    Ok(())
}

async fn submit(engine: &Engine, records: Vec<Record>) -> Result<()> {
    let count = records.len();
    match engine.submit(Batch::new(records)).await? {
        Accepted::Sent => debug!("AGENT | Sent {count} records"),
        Accepted::Queued { sequence } => debug!("AGENT | Queued {count} records as seq={sequence}"),
        Accepted::DeadLettered => warn!("AGENT | Dead-lettered {count} records"),
    }
    Ok(())
}
