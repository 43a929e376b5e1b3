//! Sync Loop
//!
//! Incrementally mirrors device readings into the time-series database.
//!
//! ## Cycle
//!
//! ```text
//! resolve start ─▶ sink reachable? ─▶ fetch (all series) ─▶ normalize ─▶ commit ─▶ checkpoint
//!       ▲              (retry)            (retry)           (abort on      (no progress
//!       │                                                   bad data)       on failure)
//!       └──────────── sleep ◀── proactive token renewal ◀──────────────────────┘
//! ```
//!
//! The checkpoint only advances after a successful commit, to one past the
//! newest committed timestamp. A crash between commit and checkpoint means
//! the last batch is delivered again on restart; the sink overwrites it.

mod engine;

pub use engine::{CycleOutcome, CycleReport, SyncConfig, SyncEngine, SyncError};
