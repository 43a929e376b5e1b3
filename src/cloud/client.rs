//! Device Cloud REST Client
//!
//! HTTPS/JSON client for the device-cloud API. Every request carries the
//! caller's bearer token and is bounded by the client-level timeout.

use super::{App, CloudApi, CloudError, DeviceInfo, Publisher, RawRecord};
use crate::state::Credential;
use crate::transform::parse_timestamp_ms;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Device cloud REST API client
pub struct CloudClient {
    client: Client,
    config: CloudConfig,
}

/// Configuration for the cloud client
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL of the API (e.g., "https://api.relayr.io")
    pub base_url: String,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Redirect URI announced when registering an application
    pub redirect_uri: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.relayr.io".to_string(),
            request_timeout_secs: 30,
            redirect_uri: "http://localhost".to_string(),
        }
    }
}

impl CloudClient {
    /// Create a new client with the given configuration
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("cloudbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        token: &str,
    ) -> Result<T, CloudError> {
        let response = request.bearer_auth(token).send().await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(CloudError::Unauthorized(format!("{}: {}", status, text)))
    } else {
        Err(CloudError::Status {
            status: status.as_u16(),
            message: text,
        })
    }
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn device(&self, token: &str, device_id: &str) -> Result<DeviceInfo, CloudError> {
        let url = self.url(&format!("/devices/{}", urlencoding::encode(device_id)));
        let device: DeviceResponse = self.send_json(self.client.get(&url), token).await?;
        Ok(device.into_info())
    }

    async fn group_devices(&self, token: &str, group_id: &str) -> Result<Vec<String>, CloudError> {
        let url = self.url(&format!(
            "/device-groups/{}/flat",
            urlencoding::encode(group_id)
        ));
        let group: GroupResponse = self.send_json(self.client.get(&url), token).await?;
        Ok(group.devices.into_iter().map(|d| d.id).collect())
    }

    async fn model_series(
        &self,
        token: &str,
        model_id: &str,
        model_version: Option<&str>,
    ) -> Result<Vec<String>, CloudError> {
        let path = match model_version {
            Some(version) => format!(
                "/device-models/{}/versions/{}",
                urlencoding::encode(model_id),
                urlencoding::encode(version)
            ),
            None => format!("/device-models/{}", urlencoding::encode(model_id)),
        };

        let model: ModelResponse = self.send_json(self.client.get(self.url(&path)), token).await?;
        Ok(model.measurements.into_iter().map(|m| m.name).collect())
    }

    async fn readings(
        &self,
        token: &str,
        device_id: &str,
        series: &str,
        since_ms: i64,
        interval: &str,
    ) -> Result<Vec<RawRecord>, CloudError> {
        let url = self.url(&format!(
            "/devices/{}/aggregated-readings",
            urlencoding::encode(device_id)
        ));
        let start = since_ms.to_string();
        let request = self.client.get(&url).query(&[
            ("meaning", series),
            ("start", start.as_str()),
            ("interval", interval),
            ("aggregates", "avg"),
        ]);

        let body: ReadingsResponse = self.send_json(request, token).await?;
        body.into_records(series)
    }

    async fn renew_token(&self, token: &str, app_id: &str) -> Result<Credential, CloudError> {
        let url = self.url(&format!(
            "/oauth2/appdev-token/{}",
            urlencoding::encode(app_id)
        ));
        let body: TokenResponse = self.send_json(self.client.post(&url), token).await?;

        let expires_at = parse_timestamp_ms(&body.expires_at)
            .map_err(|e| CloudError::Decode(format!("expiresAt {:?}: {}", body.expires_at, e)))?;

        Ok(Credential {
            token: body.token,
            expires_at,
        })
    }

    async fn publishers(&self, token: &str, owner: &str) -> Result<Vec<Publisher>, CloudError> {
        let url = self.url(&format!("/users/{}/publishers", urlencoding::encode(owner)));
        self.send_json(self.client.get(&url), token).await
    }

    async fn apps(&self, token: &str, publisher_id: &str) -> Result<Vec<App>, CloudError> {
        let url = self.url(&format!(
            "/publishers/{}/apps",
            urlencoding::encode(publisher_id)
        ));
        self.send_json(self.client.get(&url), token).await
    }

    async fn register_app(
        &self,
        token: &str,
        publisher_id: &str,
        name: &str,
    ) -> Result<App, CloudError> {
        let body = RegisterAppRequest {
            name,
            publisher: publisher_id,
            redirect_uri: &self.config.redirect_uri,
            description: "Synchronizes device readings into a time-series database",
        };
        let request = self.client.post(self.url("/apps")).json(&body);
        self.send_json(request, token).await
    }
}

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceResponse {
    id: String,
    #[serde(default)]
    name: String,
    model_id: String,
    #[serde(default)]
    model_version: Option<serde_json::Value>,
    #[serde(default)]
    owner: Option<String>,
}

impl DeviceResponse {
    fn into_info(self) -> DeviceInfo {
        // Versions come back as numbers or strings depending on the model
        let model_version = self.model_version.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        DeviceInfo {
            id: self.id,
            name: self.name,
            model_id: self.model_id,
            model_version,
            owner: self.owner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GroupResponse {
    #[serde(default)]
    devices: Vec<GroupDevice>,
}

#[derive(Debug, Deserialize)]
struct GroupDevice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    measurements: Vec<Measurement>,
}

#[derive(Debug, Deserialize)]
struct Measurement {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    #[serde(default)]
    results: Vec<ReadingsResult>,
}

#[derive(Debug, Deserialize)]
struct ReadingsResult {
    #[serde(default)]
    meaning: Option<String>,
    #[serde(default)]
    points: Vec<ReadingPoint>,
}

#[derive(Debug, Deserialize)]
struct ReadingPoint {
    timestamp: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    avg: Option<serde_json::Value>,
}

impl ReadingsResponse {
    fn into_records(self, requested: &str) -> Result<Vec<RawRecord>, CloudError> {
        let mut records = Vec::new();

        for result in self.results {
            let series = result.meaning.unwrap_or_else(|| requested.to_string());
            for point in result.points {
                // Empty aggregation buckets carry no value
                let Some(raw) = point.value.as_ref().or(point.avg.as_ref()) else {
                    tracing::debug!(
                        series = %series,
                        timestamp = %point.timestamp,
                        "Skipping point without a value"
                    );
                    continue;
                };

                let value = numeric(raw).ok_or_else(|| {
                    CloudError::Decode(format!(
                        "point at {} of series {} has a non-numeric value {}",
                        point.timestamp, series, raw
                    ))
                })?;

                records.push(RawRecord {
                    series: series.clone(),
                    timestamp: point.timestamp,
                    value,
                });
            }
        }

        Ok(records)
    }
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAppRequest<'a> {
    name: &'a str,
    publisher: &'a str,
    redirect_uri: &'a str,
    description: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CloudConfig::default();
        assert_eq!(config.base_url, "https://api.relayr.io");
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_url_joining() {
        let client = CloudClient::new(CloudConfig {
            base_url: "https://example.test/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.url("/devices/x"), "https://example.test/devices/x");
    }

    #[test]
    fn test_readings_decode_value_and_avg() {
        let body: ReadingsResponse = serde_json::from_str(
            r#"{"results":[
                {"meaning":"temperature","points":[
                    {"timestamp":"2020-01-01T00:00:00.000000Z","value":21.5},
                    {"timestamp":"2020-01-01T00:01:00.000000Z","avg":"22"}
                ]},
                {"points":[{"timestamp":"2020-01-01T00:02:00.000000Z","value":1}]}
            ]}"#,
        )
        .unwrap();

        let records = body.into_records("humidity").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].series, "temperature");
        assert_eq!(records[0].value, 21.5);
        assert_eq!(records[1].value, 22.0);
        assert_eq!(records[2].series, "humidity");
    }

    #[test]
    fn test_readings_skip_empty_buckets() {
        let body: ReadingsResponse = serde_json::from_str(
            r#"{"results":[{"meaning":"t","points":[
                {"timestamp":"2020-01-01T00:00:00.000000Z","avg":null},
                {"timestamp":"2020-01-01T00:01:00.000000Z"},
                {"timestamp":"2020-01-01T00:02:00.000000Z","avg":4.5}
            ]}]}"#,
        )
        .unwrap();

        let records = body.into_records("t").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 4.5);
    }

    #[test]
    fn test_readings_non_numeric_value_is_decode_error() {
        let body: ReadingsResponse = serde_json::from_str(
            r#"{"results":[{"meaning":"t","points":[
                {"timestamp":"2020-01-01T00:00:00Z","value":"n/a"}
            ]}]}"#,
        )
        .unwrap();

        let err = body.into_records("t").unwrap_err();
        assert!(matches!(err, CloudError::Decode(_)));
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn test_group_response_decode() {
        let group: GroupResponse = serde_json::from_str(
            r#"{"id":"g","name":"plant","devices":[{"id":"d1","name":"a"},{"id":"d2"}]}"#,
        )
        .unwrap();
        let ids: Vec<_> = group.devices.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
    }

    #[test]
    fn test_empty_readings() {
        let body: ReadingsResponse = serde_json::from_str("{}").unwrap();
        assert!(body.into_records("t").unwrap().is_empty());
    }

    #[test]
    fn test_device_numeric_model_version() {
        let device: DeviceResponse = serde_json::from_str(
            r#"{"id":"d","name":"n","modelId":"m","modelVersion":3,"owner":"o"}"#,
        )
        .unwrap();
        let info = device.into_info();
        assert_eq!(info.model_version.as_deref(), Some("3"));
        assert_eq!(info.owner.as_deref(), Some("o"));
    }
}
