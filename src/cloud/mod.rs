//! Device Cloud Access
//!
//! Everything that talks to the remote device-cloud API:
//!
//! - **client**: reqwest implementation of [`CloudApi`]
//! - **credentials**: access token lifecycle and application identity
//! - **series**: discovery of the series a device or device group reports
//! - **fetch**: concurrent, all-or-nothing retrieval of new readings
//!
//! ## Token ownership
//!
//! The [`CredentialManager`] is the only writer of the access token. Every
//! other component receives a copy of the token for the request it is about
//! to make, so no token is ever shared mutably between concurrent requests.

mod client;
mod credentials;
mod fetch;
mod series;

pub use client::{CloudClient, CloudConfig};
pub use credentials::{AuthError, CredentialManager};
pub use fetch::Fetcher;
pub use series::{resolve_series, SeriesRef, SeriesSet, Target};

use crate::state::Credential;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// A reading as delivered by the cloud, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Series (meaning) the reading belongs to
    pub series: String,
    /// ISO-8601 timestamp with fractional seconds and `Z` suffix
    pub timestamp: String,
    /// Reading, or the bucket average for aggregated queries
    pub value: f64,
}

/// Device metadata needed for discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub model_id: String,
    pub model_version: Option<String>,
    pub owner: Option<String>,
}

/// A publisher account belonging to a user
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Publisher {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A registered application under a publisher
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct App {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Remote API surface used by the bridge.
///
/// Every call receives the bearer token by value; implementations must not
/// cache or mutate it.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Look up a device
    async fn device(&self, token: &str, device_id: &str) -> Result<DeviceInfo, CloudError>;

    /// Ids of every device in a group, nested groups flattened
    async fn group_devices(&self, token: &str, group_id: &str) -> Result<Vec<String>, CloudError>;

    /// Names of the series defined by a device model
    async fn model_series(
        &self,
        token: &str,
        model_id: &str,
        model_version: Option<&str>,
    ) -> Result<Vec<String>, CloudError>;

    /// Aggregated (average) readings of one series since `since_ms`
    async fn readings(
        &self,
        token: &str,
        device_id: &str,
        series: &str,
        since_ms: i64,
        interval: &str,
    ) -> Result<Vec<RawRecord>, CloudError>;

    /// Exchange the current token for a fresh one through an application identity
    async fn renew_token(&self, token: &str, app_id: &str) -> Result<Credential, CloudError>;

    /// Publisher accounts owned by a user
    async fn publishers(&self, token: &str, owner: &str) -> Result<Vec<Publisher>, CloudError>;

    /// Applications registered under a publisher
    async fn apps(&self, token: &str, publisher_id: &str) -> Result<Vec<App>, CloudError>;

    /// Register a new application under a publisher
    async fn register_app(
        &self,
        token: &str,
        publisher_id: &str,
        name: &str,
    ) -> Result<App, CloudError>;
}

/// Errors returned by the device cloud
#[derive(Debug, Error)]
pub enum CloudError {
    /// Token rejected (expired or revoked)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),
}

impl CloudError {
    /// Whether a token renewal could fix this error
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CloudError::Timeout(err.to_string())
        } else if err.is_decode() {
            CloudError::Decode(err.to_string())
        } else {
            CloudError::Transport(err.to_string())
        }
    }
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory [`CloudApi`] used by the unit tests

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCloud {
        pub devices: Mutex<HashMap<String, DeviceInfo>>,
        /// Measurement names per model id
        pub models: Mutex<HashMap<String, Vec<String>>>,
        pub groups: Mutex<HashMap<String, Vec<String>>>,
        /// Records per (device, measurement), filtered by `since_ms` on read
        pub records: Mutex<HashMap<(String, String), Vec<(i64, RawRecord)>>>,
        /// Scripted failures consumed by `readings`, one per call
        pub readings_failures: Mutex<VecDeque<CloudError>>,
        pub renewals: Mutex<VecDeque<Result<Credential, CloudError>>>,
        pub publishers: Mutex<Vec<Publisher>>,
        pub apps: Mutex<Vec<App>>,
        pub calls: Mutex<Vec<String>>,
        pub tokens_seen: Mutex<Vec<String>>,
    }

    impl FakeCloud {
        /// A cloud holding device `dev-1`, owned by `owner-1`
        pub fn with_device(series: &[&str]) -> Self {
            let fake = FakeCloud::default();
            fake.add_device("dev-1", "Sensor", "model-1", series);
            fake
        }

        pub fn add_device(&self, id: &str, name: &str, model_id: &str, series: &[&str]) {
            self.devices.lock().unwrap().insert(
                id.to_string(),
                DeviceInfo {
                    id: id.into(),
                    name: name.into(),
                    model_id: model_id.into(),
                    model_version: Some("1".into()),
                    owner: Some("owner-1".into()),
                },
            );
            self.models.lock().unwrap().insert(
                model_id.to_string(),
                series.iter().map(|s| s.to_string()).collect(),
            );
        }

        pub fn add_group(&self, id: &str, devices: &[&str]) {
            self.groups.lock().unwrap().insert(
                id.to_string(),
                devices.iter().map(|d| d.to_string()).collect(),
            );
        }

        /// Add a reading of `dev-1`
        pub fn push_record(&self, series: &str, timestamp: &str, value: f64) {
            self.push_device_record("dev-1", series, timestamp, value);
        }

        pub fn push_device_record(&self, device: &str, series: &str, timestamp: &str, value: f64) {
            let ts = crate::transform::parse_timestamp_ms(timestamp).unwrap_or(i64::MAX);
            self.insert_record(device, series, ts, timestamp, value);
        }

        /// Insert a reading of `dev-1` with an explicit filter key (used for malformed timestamps)
        pub fn push_raw(&self, series: &str, filter_ts: i64, timestamp: &str, value: f64) {
            self.insert_record("dev-1", series, filter_ts, timestamp, value);
        }

        fn insert_record(&self, device: &str, series: &str, ts: i64, timestamp: &str, value: f64) {
            self.records
                .lock()
                .unwrap()
                .entry((device.to_string(), series.to_string()))
                .or_default()
                .push((
                    ts,
                    RawRecord {
                        series: series.to_string(),
                        timestamp: timestamp.to_string(),
                        value,
                    },
                ));
        }

        pub fn calls(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
        }

        fn record_call(&self, name: &str, token: &str) {
            self.calls.lock().unwrap().push(name.to_string());
            self.tokens_seen.lock().unwrap().push(token.to_string());
        }
    }

    fn not_found(what: &str) -> CloudError {
        CloudError::Status {
            status: 404,
            message: format!("no such {}", what),
        }
    }

    #[async_trait]
    impl CloudApi for FakeCloud {
        async fn device(&self, token: &str, device_id: &str) -> Result<DeviceInfo, CloudError> {
            self.record_call("device", token);
            self.devices
                .lock()
                .unwrap()
                .get(device_id)
                .cloned()
                .ok_or_else(|| not_found("device"))
        }

        async fn group_devices(
            &self,
            token: &str,
            group_id: &str,
        ) -> Result<Vec<String>, CloudError> {
            self.record_call("group_devices", token);
            self.groups
                .lock()
                .unwrap()
                .get(group_id)
                .cloned()
                .ok_or_else(|| not_found("group"))
        }

        async fn model_series(
            &self,
            token: &str,
            model_id: &str,
            _model_version: Option<&str>,
        ) -> Result<Vec<String>, CloudError> {
            self.record_call("model_series", token);
            self.models
                .lock()
                .unwrap()
                .get(model_id)
                .cloned()
                .ok_or_else(|| not_found("model"))
        }

        async fn readings(
            &self,
            token: &str,
            device_id: &str,
            series: &str,
            since_ms: i64,
            _interval: &str,
        ) -> Result<Vec<RawRecord>, CloudError> {
            self.record_call("readings", token);
            if let Some(err) = self.readings_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&(device_id.to_string(), series.to_string()))
                .map(|rs| {
                    rs.iter()
                        .filter(|(ts, _)| *ts >= since_ms)
                        .map(|(_, r)| r.clone())
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn renew_token(&self, token: &str, _app_id: &str) -> Result<Credential, CloudError> {
            self.record_call("renew_token", token);
            self.renewals
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CloudError::Transport("no renewal scripted".into())))
        }

        async fn publishers(
            &self,
            token: &str,
            _owner: &str,
        ) -> Result<Vec<Publisher>, CloudError> {
            self.record_call("publishers", token);
            Ok(self.publishers.lock().unwrap().clone())
        }

        async fn apps(&self, token: &str, _publisher_id: &str) -> Result<Vec<App>, CloudError> {
            self.record_call("apps", token);
            Ok(self.apps.lock().unwrap().clone())
        }

        async fn register_app(
            &self,
            token: &str,
            _publisher_id: &str,
            name: &str,
        ) -> Result<App, CloudError> {
            self.record_call("register_app", token);
            let app = App {
                id: format!("app-{}", name),
                name: name.to_string(),
            };
            self.apps.lock().unwrap().push(app.clone());
            Ok(app)
        }
    }
}
