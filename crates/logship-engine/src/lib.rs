// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship-engine
//!
//! Fault-tolerant delivery engine for a log/metric shipping agent.
//!
//! Upstream collectors hand batches of records to an [`engine::Engine`]. Depending on the
//! configured [`config::Strategy`], the engine either tries a direct send first and keeps the
//! durable queue as a backup path, or persists every batch before handing it to a pool of
//! delivery workers.
//!
//! ```text
//!   submit(batch)
//!        │
//!        v
//!   ┌──────────┐  direct send (backup_only)   ┌──────────┐
//!   │ Strategy │ ───────────────────────────> │   Sink   │
//!   └────┬─────┘                              └────^─────┘
//!        │ append                                  │ send
//!        v                                         │
//!   ┌──────────┐   lease / ack / release     ┌─────┴─────┐
//!   │  Durable │ <─────────────────────────> │  Workers  │ (rate limited)
//!   │  Queue   │                             └───────────┘
//!   └────┬─────┘
//!        │ sync
//!        v
//!   ┌──────────┐
//!   │Checkpoint│ (timer task)
//!   └──────────┘
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// Exponential retry backoff policy
pub mod backoff;

/// Periodic checkpoint task
pub mod checkpoint;

/// Engine configuration and option validation
pub mod config;

/// Strategy engine: the entry point for upstream producers
pub mod engine;

/// Error types
pub mod error;

/// Log line formatter for the agent binary
pub mod logger;

/// Durable queue with disk and memory backings
pub mod queue;

/// Token-bucket rate limiting
pub mod rate_limit;

/// Records and batches
pub mod record;

/// Sink adapter boundary and built-in sinks
pub mod sink;

/// Delivery worker pool
pub mod worker;

pub use engine::{Accepted, Engine, EngineStats};
pub use record::{Batch, Record};
