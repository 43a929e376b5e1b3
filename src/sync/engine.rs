//! Sync engine
//!
//! Drives fetch → normalize → commit → checkpoint, one cycle at a time.
//! Cycles never overlap. Unavailable dependencies are retried with a fixed
//! delay for as long as it takes; nothing in here ends the loop.

use crate::cloud::{
    now_ms, resolve_series, AuthError, CloudApi, CloudError, CredentialManager, Fetcher,
    RawRecord, SeriesSet, Target,
};
use crate::sink::{PointSink, SinkError};
use crate::state::{StateError, StateStore};
use crate::transform::{normalize_batch, TransformError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the sync loop
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device or device group whose readings are mirrored
    pub target: Target,
    /// Only poll series whose name contains this string
    pub series_filter: Option<String>,
    /// Aggregation bucket width passed to the API
    pub aggregation_interval: String,
    /// Divisor applied to every reading; validated non-zero
    pub norm_factor: f64,
    /// Sleep between cycles
    pub interval: Duration,
    /// Fixed delay between retries of the sink or the fetch step
    pub retry_delay: Duration,
    /// Start position for the first cycle only
    pub start_override: Option<i64>,
    /// Minimum token validity left when a request is issued
    pub request_window: Duration,
    /// Renew proactively when the token expires within `interval + renewal_margin`
    pub renewal_margin: Duration,
    /// Start position when no checkpoint exists
    pub default_lookback: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target: Target::Device(String::new()),
            series_filter: None,
            aggregation_interval: "1m".to_string(),
            norm_factor: 1.0,
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            start_override: None,
            request_window: Duration::from_secs(60),
            renewal_margin: Duration::from_secs(30 * 60),
            default_lookback: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

/// Errors ending a single cycle. None of them stops the loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The fetched batch contained a malformed record; nothing was written
    #[error("Malformed batch: {0}")]
    Data(#[from] TransformError),

    /// The sink refused the batch; the checkpoint did not move
    #[error("Commit failed: {0}")]
    Commit(#[source] SinkError),

    /// The batch was written but the checkpoint could not be saved
    #[error("Checkpoint not persisted: {0}")]
    State(#[from] StateError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
}

impl SyncError {
    /// Errors no retry within the current cycle can fix
    fn ends_cycle(&self) -> bool {
        match self {
            SyncError::Auth(_) => true,
            SyncError::Cloud(e) => e.is_unauthorized(),
            _ => false,
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Points were written and the checkpoint advanced
    Committed,
    /// Nothing new; checkpoint unchanged
    Empty,
}

/// Summary of one completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Position the cycle fetched from (exclusive)
    pub start: i64,
    /// Records returned by the API
    pub fetched: usize,
    /// Points written to the sink
    pub committed: usize,
    /// Persisted checkpoint after the cycle
    pub checkpoint: Option<i64>,
    pub outcome: CycleOutcome,
}

/// Orchestrates the incremental synchronization of one target
pub struct SyncEngine {
    config: SyncConfig,
    api: Arc<dyn CloudApi>,
    fetcher: Fetcher,
    credentials: CredentialManager,
    sink: Arc<dyn PointSink>,
    store: Arc<StateStore>,
    series: Option<SeriesSet>,
    start_override: Option<i64>,
    /// Set once a renewal failed; cleared at the start of every cycle
    renewal_failed: bool,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn CloudApi>,
        credentials: CredentialManager,
        sink: Arc<dyn PointSink>,
        store: Arc<StateStore>,
    ) -> Self {
        let fetcher = Fetcher::new(Arc::clone(&api), config.aggregation_interval.clone());

        Self {
            start_override: config.start_override,
            config,
            api,
            fetcher,
            credentials,
            sink,
            store,
            series: None,
            renewal_failed: false,
        }
    }

    /// Run cycles until the process is stopped
    pub async fn run(&mut self) {
        tracing::info!(
            target = %self.config.target,
            database = %self.sink.namespace(),
            interval_secs = self.config.interval.as_secs(),
            "Starting sync loop"
        );

        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    tracing::info!(
                        fetched = report.fetched,
                        committed = report.committed,
                        checkpoint = ?report.checkpoint,
                        outcome = ?report.outcome,
                        "Sync cycle completed"
                    );
                }
                Err(SyncError::Data(e)) => {
                    tracing::error!(error = %e, "Discarding malformed batch, will fetch it again next cycle");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Sync cycle failed, checkpoint unchanged");
                }
            }

            tracing::debug!(secs = self.config.interval.as_secs(), "Sleeping until next cycle");
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Perform exactly one cycle, without the trailing sleep
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        self.renewal_failed = false;
        let start = self.resolve_start();
        tracing::info!(start, "Sync cycle starting");

        self.wait_for_sink().await;
        let records = self.fetch_until_success(start).await?;

        let result = self.commit_batch(start, records).await;
        self.renew_proactively().await;
        result
    }

    /// Override (first cycle only) > persisted checkpoint > default lookback
    fn resolve_start(&mut self) -> i64 {
        if let Some(start) = self.start_override.take() {
            tracing::info!(start, "Using explicit start position");
            return start;
        }

        match self.store.load_checkpoint() {
            Some(checkpoint) => checkpoint,
            None => {
                let start = now_ms().saturating_sub(millis(self.config.default_lookback));
                tracing::info!(start, "No checkpoint found, starting from default lookback");
                start
            }
        }
    }

    async fn wait_for_sink(&self) {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.sink.ensure_namespace().await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Database reachable again");
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Database not ready, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Retry the fetch until it succeeds or fails in a way only a later cycle can fix
    async fn fetch_until_success(&mut self, start: i64) -> Result<Vec<RawRecord>, SyncError> {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.try_fetch(start).await {
                Ok(records) => return Ok(records),
                Err(e) if e.ends_cycle() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// One fetch attempt; a rejected token gets one renewal and one retry
    async fn try_fetch(&mut self, start: i64) -> Result<Vec<RawRecord>, SyncError> {
        let token = self.request_token().await?;

        match self.fetch_with(&token, start).await {
            Err(SyncError::Cloud(e)) if e.is_unauthorized() && !self.renewal_failed => {
                tracing::warn!(error = %e, "Token rejected, renewing");
                let token = self.credentials.renew().await.map_err(|e| {
                    self.renewal_failed = true;
                    SyncError::Auth(e)
                })?;
                self.fetch_with(&token, start).await
            }
            other => other,
        }
    }

    /// Token valid for at least the request window, or the stale one if renewal fails.
    ///
    /// Renewal is attempted at most once per cycle.
    async fn request_token(&mut self) -> Result<String, SyncError> {
        if !self.renewal_failed {
            let window = millis(self.config.request_window);
            match self.credentials.ensure_valid(window).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    self.renewal_failed = true;
                    tracing::warn!(error = %e, "Token renewal failed, continuing with current token");
                }
            }
        }

        self.credentials
            .snapshot()
            .ok_or(SyncError::Auth(AuthError::NoToken))
    }

    async fn fetch_with(&mut self, token: &str, start: i64) -> Result<Vec<RawRecord>, SyncError> {
        let series = match &self.series {
            Some(series) => series.clone(),
            None => {
                let resolved = resolve_series(
                    self.api.as_ref(),
                    token,
                    &self.config.target,
                    self.config.series_filter.as_deref(),
                )
                .await?;
                self.series = Some(resolved.clone());
                resolved
            }
        };

        Ok(self.fetcher.fetch(token, &series, start).await?)
    }

    async fn commit_batch(
        &mut self,
        start: i64,
        records: Vec<RawRecord>,
    ) -> Result<CycleReport, SyncError> {
        let fetched = records.len();
        let points: Vec<_> = normalize_batch(&records, self.config.norm_factor)?
            .into_iter()
            .filter(|p| p.timestamp_ms > start)
            .collect();

        if points.len() < fetched {
            tracing::debug!(
                dropped = fetched - points.len(),
                start,
                "Dropped readings at or before the start position"
            );
        }

        let max_ts = match points.iter().map(|p| p.timestamp_ms).max() {
            Some(max_ts) => max_ts,
            None => {
                tracing::info!("No new readings");
                return Ok(CycleReport {
                    start,
                    fetched,
                    committed: 0,
                    checkpoint: self.store.load_checkpoint(),
                    outcome: CycleOutcome::Empty,
                });
            }
        };

        let committed = self.sink.commit(&points).await.map_err(SyncError::Commit)?;
        tracing::info!(points = committed, database = %self.sink.namespace(), "Committed batch");

        if committed == 0 {
            return Ok(CycleReport {
                start,
                fetched,
                committed,
                checkpoint: self.store.load_checkpoint(),
                outcome: CycleOutcome::Empty,
            });
        }

        // Half-open window: the next cycle starts just after the newest point
        let checkpoint = self.store.save_checkpoint(max_ts + 1)?;
        tracing::info!(checkpoint, "Checkpoint advanced");

        Ok(CycleReport {
            start,
            fetched,
            committed,
            checkpoint: Some(checkpoint),
            outcome: CycleOutcome::Committed,
        })
    }

    async fn renew_proactively(&mut self) {
        let lead = millis(self.config.interval.saturating_add(self.config.renewal_margin));
        if !self.credentials.needs_renewal(now_ms(), lead) {
            return;
        }
        if self.renewal_failed {
            tracing::debug!("Renewal already failed this cycle, retrying next cycle");
            return;
        }

        tracing::info!(
            expires_at = ?self.credentials.expires_at(),
            "Token expires before the next cycle, renewing"
        );
        if let Err(e) = self.credentials.ensure_valid(lead).await {
            tracing::warn!(error = %e, "Proactive token renewal failed, will retry next cycle");
        }
    }
}

/// Whole milliseconds of `duration`, saturating at `i64::MAX`
fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
