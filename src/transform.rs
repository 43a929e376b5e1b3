//! Record Transformer
//!
//! Maps raw readings from the device cloud onto canonical time-series
//! points. Pure and deterministic: no I/O, no clock.

use crate::cloud::RawRecord;
use chrono::DateTime;
use thiserror::Error;

/// A normalized `(series, timestamp, value)` tuple ready for the sink
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalPoint {
    /// Series (measurement) name
    pub series: String,
    /// Unix timestamp in milliseconds, UTC
    pub timestamp_ms: i64,
    /// Reading divided by the normalization factor
    pub value: f64,
}

/// Errors raised while normalizing a record
#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("Invalid timestamp {timestamp:?} in series {series}: {reason}")]
    Timestamp {
        series: String,
        timestamp: String,
        reason: String,
    },
}

/// Parse an ISO-8601 timestamp (`2016-12-06T11:40:00.123456Z`) into Unix ms
pub fn parse_timestamp_ms(timestamp: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| e.to_string())
}

/// Normalize one raw record.
///
/// `norm_factor` is validated as finite and non-zero at configuration time.
pub fn normalize(
    series: &str,
    record: &RawRecord,
    norm_factor: f64,
) -> Result<CanonicalPoint, TransformError> {
    let timestamp_ms =
        parse_timestamp_ms(&record.timestamp).map_err(|reason| TransformError::Timestamp {
            series: series.to_string(),
            timestamp: record.timestamp.clone(),
            reason,
        })?;

    Ok(CanonicalPoint {
        series: series.to_string(),
        timestamp_ms,
        value: record.value / norm_factor,
    })
}

/// Normalize a whole batch; the first malformed record fails the batch
pub fn normalize_batch(
    records: &[RawRecord],
    norm_factor: f64,
) -> Result<Vec<CanonicalPoint>, TransformError> {
    records
        .iter()
        .map(|r| normalize(&r.series, r, norm_factor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: &str, value: f64) -> RawRecord {
        RawRecord {
            series: "temperature".into(),
            timestamp: ts.into(),
            value,
        }
    }

    #[test]
    fn test_normalize_divides_and_parses() {
        let point = normalize("temperature", &record("2016-12-06T11:40:00.250000Z", 2150.0), 100.0)
            .unwrap();

        assert_eq!(point.series, "temperature");
        assert_eq!(point.timestamp_ms, 1_481_024_400_250);
        assert!((point.value - 21.5).abs() < 1e-9);
    }

    #[test]
    fn test_default_factor_keeps_value() {
        let point = normalize("t", &record("1970-01-01T00:00:01.000Z", 3.25), 1.0).unwrap();
        assert_eq!(point.timestamp_ms, 1_000);
        assert_eq!(point.value, 3.25);
    }

    #[test]
    fn test_offset_timestamps_are_converted_to_utc() {
        let utc = parse_timestamp_ms("2020-01-01T00:00:00.000Z").unwrap();
        let offset = parse_timestamp_ms("2020-01-01T01:00:00.000+01:00").unwrap();
        assert_eq!(utc, offset);
    }

    #[test]
    fn test_malformed_timestamp() {
        let err = normalize("humidity", &record("yesterday", 1.0), 1.0).unwrap_err();
        match err {
            TransformError::Timestamp { series, timestamp, .. } => {
                assert_eq!(series, "humidity");
                assert_eq!(timestamp, "yesterday");
            }
        }
    }

    #[test]
    fn test_batch_fails_as_a_whole() {
        let records = vec![
            record("2020-01-01T00:00:00.000Z", 1.0),
            record("not-a-date", 2.0),
            record("2020-01-01T00:00:02.000Z", 3.0),
        ];
        assert!(normalize_batch(&records, 1.0).is_err());

        let ok = normalize_batch(&records[..1], 1.0).unwrap();
        assert_eq!(ok.len(), 1);
    }
}
