//! Durable bridge state
//!
//! Holds everything that has to survive a restart for one target:
//!
//! - **checkpoint**: first timestamp (ms) not yet synchronized
//! - **credential**: the last issued access token and its expiry
//! - **app_id**: application identity used to renew tokens
//!
//! All three live in a single versioned, checksummed JSON record per target.
//! Writes go to a temporary file which is fsynced and renamed over the
//! record, so a crash leaves either the old or the new record on disk.
//!
//! Only one process may use a given state file at a time. Running two
//! bridges against the same target name is not supported.

pub mod error;
pub mod store;

pub use error::{StateError, StateResult};
pub use store::{Credential, StateBody, StateStore, STATE_VERSION};
