//! Pacer watches pipeline execution records and decides which of them get to run.
//!
//! Incoming source-control events are authorized against the provider, turned into execution records and
//! then shepherded by a reconciler that enforces a per-repository concurrency limit. Cancellation requests
//! are resolved against the live set of records through their labels.

pub mod acl;
pub mod cancel;
pub mod cli;
pub mod conf;
pub mod dispatch;
pub mod models;
pub mod provider;
pub mod reconciler;
pub mod store;
pub mod sync;
pub mod validate;

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time in epoch milliseconds.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    u64::try_from(current_epoch).unwrap_or(u64::MAX)
}
