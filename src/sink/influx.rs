//! InfluxDB sink
//!
//! Speaks the InfluxDB 1.x HTTP API:
//! - `POST /query` with `CREATE DATABASE` (a no-op when the database exists)
//! - `POST /write?db=<name>&precision=ms` with a line-protocol body

use super::{PointSink, SinkError};
use crate::transform::CanonicalPoint;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::fmt::Write;

/// Connection settings for InfluxDB
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8086,
            database: String::new(),
            username: "root".to_string(),
            password: "root".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl InfluxConfig {
    /// Base URL of the HTTP API
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// InfluxDB HTTP sink
pub struct InfluxSink {
    client: Client,
    config: InfluxConfig,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    async fn check(response: Response) -> Result<(), SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    fn namespace(&self) -> &str {
        &self.config.database
    }

    async fn ensure_namespace(&self) -> Result<(), SinkError> {
        let url = format!("{}/query", self.config.base_url());
        let statement = format!(
            "CREATE DATABASE \"{}\"",
            self.config.database.replace('"', "\\\"")
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .form(&[("q", statement.as_str())])
            .send()
            .await?;
        Self::check(response).await
    }

    async fn commit(&self, points: &[CanonicalPoint]) -> Result<usize, SinkError> {
        if points.is_empty() {
            return Ok(0);
        }

        let body = encode_line_protocol(points)?;
        let url = format!("{}/write", self.config.base_url());

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("db", self.config.database.as_str()), ("precision", "ms")])
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;

        Ok(points.len())
    }
}

/// Encode points as line protocol, one `<series> value=<v> <ts>` per line
pub fn encode_line_protocol(points: &[CanonicalPoint]) -> Result<String, SinkError> {
    let mut body = String::with_capacity(points.len() * 48);

    for point in points {
        if !point.value.is_finite() {
            return Err(SinkError::Encode(format!(
                "{} at {} has non-finite value {}",
                point.series, point.timestamp_ms, point.value
            )));
        }
        if point.series.is_empty() {
            return Err(SinkError::Encode(format!(
                "point at {} has an empty series name",
                point.timestamp_ms
            )));
        }

        writeln!(
            body,
            "{} value={} {}",
            escape_measurement(&point.series),
            point.value,
            point.timestamp_ms
        )
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    }

    Ok(body)
}

fn escape_measurement(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' | ' ' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(series: &str, ts: i64, value: f64) -> CanonicalPoint {
        CanonicalPoint {
            series: series.into(),
            timestamp_ms: ts,
            value,
        }
    }

    #[test]
    fn test_line_protocol() {
        let body = encode_line_protocol(&[point("temperature", 1000, 21.5), point("hum", 2000, 40.0)])
            .unwrap();
        assert_eq!(body, "temperature value=21.5 1000\nhum value=40 2000\n");
    }

    #[test]
    fn test_measurement_escaping() {
        let body = encode_line_protocol(&[point("air quality,pm2.5", 1, 3.0)]).unwrap();
        assert_eq!(body, "air\\ quality\\,pm2.5 value=3 1\n");
    }

    #[test]
    fn test_same_batch_encodes_identically() {
        let batch = vec![point("a", 1, 1.0), point("a", 2, 2.0)];
        assert_eq!(
            encode_line_protocol(&batch).unwrap(),
            encode_line_protocol(&batch).unwrap()
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = encode_line_protocol(&[point("a", 1, f64::NAN)]).unwrap_err();
        assert!(matches!(err, SinkError::Encode(_)));
    }

    #[test]
    fn test_base_url() {
        let mut config = InfluxConfig::default();
        assert_eq!(config.base_url(), "http://localhost:8086");

        config.host = "https://influx.example".into();
        config.port = 443;
        assert_eq!(config.base_url(), "https://influx.example:443");
    }

    #[tokio::test]
    async fn test_empty_commit_sends_nothing() {
        // Port 9 (discard) is never contacted for an empty batch
        let sink = InfluxSink::new(InfluxConfig {
            port: 9,
            database: "db".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(sink.commit(&[]).await.unwrap(), 0);
        assert_eq!(sink.namespace(), "db");
    }
}
