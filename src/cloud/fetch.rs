//! Fetch Client
//!
//! Retrieves new readings for every series of a target. Series are fetched
//! concurrently but the result is all-or-nothing: one failing series fails
//! the whole fetch, so a checkpoint only ever advances over a complete batch.

use super::{CloudApi, CloudError, RawRecord, SeriesSet};
use futures_util::future::try_join_all;
use std::sync::Arc;

/// Fetches aggregated readings for a set of series
pub struct Fetcher {
    api: Arc<dyn CloudApi>,
    /// Aggregation bucket width, e.g. "1m"
    interval: String,
}

impl Fetcher {
    pub fn new(api: Arc<dyn CloudApi>, interval: impl Into<String>) -> Self {
        Self {
            api,
            interval: interval.into(),
        }
    }

    /// Fetch every series in `series` since `since_ms`.
    ///
    /// `token` is a snapshot taken by the caller; each request gets its own copy.
    /// Records come back named after [`SeriesRef::name`](super::SeriesRef).
    pub async fn fetch(
        &self,
        token: &str,
        series: &SeriesSet,
        since_ms: i64,
    ) -> Result<Vec<RawRecord>, CloudError> {
        let requests = series.iter().map(|series_ref| {
            let token = token.to_string();
            async move {
                let records = self
                    .api
                    .readings(
                        &token,
                        &series_ref.device_id,
                        &series_ref.measurement,
                        since_ms,
                        &self.interval,
                    )
                    .await?;

                Ok::<_, CloudError>(
                    records
                        .into_iter()
                        .map(|record| RawRecord {
                            series: series_ref.name.clone(),
                            ..record
                        })
                        .collect::<Vec<_>>(),
                )
            }
        });

        let batches = try_join_all(requests).await?;
        let records: Vec<RawRecord> = batches.into_iter().flatten().collect();

        tracing::debug!(
            series = series.len(),
            records = records.len(),
            since_ms,
            "Fetched readings"
        );

        Ok(records)
    }
}
