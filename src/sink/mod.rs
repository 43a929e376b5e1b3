//! Time-Series Sink
//!
//! Commits canonical points to the time-series database.
//!
//! - **influx**: InfluxDB 1.x HTTP API (line protocol, millisecond precision)
//!
//! Commits must be safe to repeat: writing the same series and timestamp
//! twice leaves the database as if it had been written once. The sync loop
//! relies on this to re-deliver a batch after a crash between commit and
//! checkpoint.

mod influx;

pub use influx::{encode_line_protocol, InfluxConfig, InfluxSink};

use crate::transform::CanonicalPoint;
use async_trait::async_trait;
use thiserror::Error;

/// Destination for canonical points
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Name of the target namespace (database)
    fn namespace(&self) -> &str;

    /// Create the namespace if absent; succeeds if it already exists
    async fn ensure_namespace(&self) -> Result<(), SinkError>;

    /// Write a batch, returning the number of points written
    async fn commit(&self, points: &[CanonicalPoint]) -> Result<usize, SinkError>;
}

/// Errors returned by a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database unreachable: {0}")]
    Unreachable(String),

    #[error("Database timeout")]
    Timeout,

    #[error("Database rejected request {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Cannot encode point: {0}")]
    Encode(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout
        } else {
            SinkError::Unreachable(err.to_string())
        }
    }
}
