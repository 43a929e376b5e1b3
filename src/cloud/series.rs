//! Series discovery
//!
//! Resolves the set of series a target reports. A single device goes
//! device → model → measurements; a device group is first flattened into its
//! member devices, each resolved the same way.

use super::{CloudApi, CloudError};
use std::collections::BTreeSet;
use std::fmt;

/// What one bridge process mirrors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One device; series are stored under their measurement name
    Device(String),
    /// Every device of a group; series are stored as `<device name>.<measurement>`
    Group(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(id) => write!(f, "device {}", id),
            Target::Group(id) => write!(f, "group {}", id),
        }
    }
}

/// One measurement of one device, and the series name it is stored under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesRef {
    pub device_id: String,
    pub measurement: String,
    pub name: String,
}

/// Unique, ordered set of series to poll
pub type SeriesSet = BTreeSet<SeriesRef>;

/// Resolve the series reported by `target`.
///
/// When `filter` is set, only measurements whose name contains it are kept.
pub async fn resolve_series(
    api: &dyn CloudApi,
    token: &str,
    target: &Target,
    filter: Option<&str>,
) -> Result<SeriesSet, CloudError> {
    match target {
        Target::Device(device_id) => device_series(api, token, device_id, filter, false).await,
        Target::Group(group_id) => {
            let devices = api.group_devices(token, group_id).await?;
            tracing::info!(group = %group_id, devices = devices.len(), "Resolved device group");

            let mut series = SeriesSet::new();
            for device_id in &devices {
                series.extend(device_series(api, token, device_id, filter, true).await?);
            }
            Ok(series)
        }
    }
}

async fn device_series(
    api: &dyn CloudApi,
    token: &str,
    device_id: &str,
    filter: Option<&str>,
    prefixed: bool,
) -> Result<SeriesSet, CloudError> {
    let device = api.device(token, device_id).await?;
    let names = api
        .model_series(token, &device.model_id, device.model_version.as_deref())
        .await?;

    let label = if device.name.is_empty() {
        &device.id
    } else {
        &device.name
    };

    let series: SeriesSet = names
        .into_iter()
        .filter(|name| filter.map_or(true, |f| name.contains(f)))
        .map(|measurement| SeriesRef {
            device_id: device_id.to_string(),
            name: if prefixed {
                format!("{}.{}", label, measurement)
            } else {
                measurement.clone()
            },
            measurement,
        })
        .collect();

    tracing::info!(
        device = %label,
        model = %device.model_id,
        series = ?series.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Resolved series to poll"
    );

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::testing::FakeCloud;

    fn names(series: &SeriesSet) -> Vec<&str> {
        series.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_resolve_deduplicates() {
        let cloud = FakeCloud::with_device(&["temperature", "humidity", "temperature"]);
        let target = Target::Device("dev-1".into());
        let series = resolve_series(&cloud, "tok", &target, None).await.unwrap();

        assert_eq!(names(&series), vec!["humidity", "temperature"]);
        assert!(series.iter().all(|s| s.device_id == "dev-1" && s.name == s.measurement));
        assert_eq!(cloud.calls("device"), 1);
        assert_eq!(cloud.calls("model_series"), 1);
    }

    #[tokio::test]
    async fn test_resolve_with_filter() {
        let cloud = FakeCloud::with_device(&["raw#temp", "raw#hum", "battery"]);
        let target = Target::Device("dev-1".into());
        let series = resolve_series(&cloud, "tok", &target, Some("#")).await.unwrap();

        assert_eq!(names(&series), vec!["raw#hum", "raw#temp"]);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let cloud = FakeCloud::default();
        let target = Target::Device("nope".into());
        let err = resolve_series(&cloud, "tok", &target, None).await.unwrap_err();
        assert!(matches!(err, CloudError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_group_prefixes_device_names() {
        let cloud = FakeCloud::default();
        cloud.add_device("d1", "north", "m-a", &["temp", "hum"]);
        cloud.add_device("d2", "south", "m-b", &["temp"]);
        cloud.add_group("g1", &["d1", "d2"]);

        let target = Target::Group("g1".into());
        let series = resolve_series(&cloud, "tok", &target, None).await.unwrap();

        assert_eq!(names(&series), vec!["north.hum", "north.temp", "south.temp"]);
        let south = series.iter().find(|s| s.name == "south.temp").unwrap();
        assert_eq!(south.device_id, "d2");
        assert_eq!(south.measurement, "temp");
        assert_eq!(cloud.calls("group_devices"), 1);
    }

    #[tokio::test]
    async fn test_group_filter_applies_per_device() {
        let cloud = FakeCloud::default();
        cloud.add_device("d1", "north", "m-a", &["raw#temp", "battery"]);
        cloud.add_device("d2", "", "m-b", &["raw#hum"]);
        cloud.add_group("g1", &["d1", "d2"]);

        let target = Target::Group("g1".into());
        let series = resolve_series(&cloud, "tok", &target, Some("#")).await.unwrap();

        // A device without a name is labelled by its id
        assert_eq!(names(&series), vec!["north.raw#temp", "d2.raw#hum"]);
    }

    #[tokio::test]
    async fn test_empty_group() {
        let cloud = FakeCloud::default();
        cloud.add_group("g1", &[]);

        let target = Target::Group("g1".into());
        let series = resolve_series(&cloud, "tok", &target, None).await.unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Device("d".into()).to_string(), "device d");
        assert_eq!(Target::Group("g".into()).to_string(), "group g");
    }
}
