//! # cloudbridge
//!
//! Incrementally mirrors time-series readings of a device, or of every device
//! in a device group, from a device-cloud API into a local time-series database.
//!
//! ## Features
//!
//! - **Resumable**: a durable checkpoint records how far the target is synchronized
//! - **No silent loss**: the checkpoint only moves after a successful commit
//! - **Self-renewing credentials**: tokens are exchanged before they expire
//! - **Resilient**: database and API outages are retried until they recover
//!
//! ## Modules
//!
//! - [`config`]: File, environment and flag configuration with validation
//! - [`state`]: Durable checkpoint and credential state
//! - [`cloud`]: Device cloud client, credentials and series discovery
//! - [`transform`]: Normalization of raw readings
//! - [`sink`]: Time-series database writer
//! - [`sync`]: The sync loop tying everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cloudbridge::cloud::{CloudClient, CredentialManager};
//! use cloudbridge::config::Config;
//! use cloudbridge::sink::InfluxSink;
//! use cloudbridge::state::StateStore;
//! use cloudbridge::sync::SyncEngine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_with_env(None)?;
//!     config.validate()?;
//!
//!     let store = Arc::new(StateStore::open(config.state_dir(), config.target_name())?);
//!     let api = Arc::new(CloudClient::new(config.cloud_config())?);
//!     let sink = Arc::new(InfluxSink::new(config.influx_config())?);
//!     let credentials = CredentialManager::new(
//!         api.clone(),
//!         store.clone(),
//!         config.target()?,
//!         config.cloud.app_name.clone(),
//!         config.bootstrap_credential()?,
//!     );
//!
//!     let mut engine = SyncEngine::new(config.sync_config()?, api, credentials, sink, store);
//!     engine.run().await;
//!     Ok(())
//! }
//! ```

pub mod cloud;
pub mod config;
pub mod sink;
pub mod state;
pub mod sync;
pub mod transform;

// Re-export top-level types for convenience
pub use cloud::{
    AuthError, CloudApi, CloudClient, CloudConfig, CloudError, CredentialManager, Fetcher,
    RawRecord, SeriesRef, SeriesSet, Target,
};

pub use config::{Config, ConfigError, LoggingConfig};

pub use sink::{InfluxConfig, InfluxSink, PointSink, SinkError};

pub use state::{Credential, StateError, StateStore};

pub use sync::{CycleOutcome, CycleReport, SyncConfig, SyncEngine, SyncError};

pub use transform::{normalize, CanonicalPoint, TransformError};
