//! HTTP client for ThingSpeak-style channel feeds

use crate::errors::{FetchError, MonitorError, Result};
use crate::model::{FieldIndex, Reading, FIELD_COUNT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of the latest value for a channel field.
#[async_trait]
pub trait ValueFetcher: Send + Sync {
    async fn fetch_latest(
        &self,
        channel_id: &str,
        field: FieldIndex,
        api_key: Option<&str>,
    ) -> std::result::Result<Reading, FetchError>;
}

/// One feed entry with its eight fields in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub entry_id: u64,
    pub created_at: DateTime<Utc>,
    pub fields: [Option<String>; FIELD_COUNT],
}

impl Feed {
    pub fn field(&self, index: FieldIndex) -> Option<&str> {
        self.fields[index.slot()].as_deref()
    }

    pub fn reading(&self, index: FieldIndex) -> Reading {
        Reading::new(self.entry_id, self.field(index).map(str::to_string), self.created_at)
    }
}

#[derive(Debug, Deserialize)]
struct WireFeed {
    entry_id: u64,
    created_at: DateTime<Utc>,
    field1: Option<String>,
    field2: Option<String>,
    field3: Option<String>,
    field4: Option<String>,
    field5: Option<String>,
    field6: Option<String>,
    field7: Option<String>,
    field8: Option<String>,
}

impl From<WireFeed> for Feed {
    fn from(wire: WireFeed) -> Self {
        Self {
            entry_id: wire.entry_id,
            created_at: wire.created_at,
            fields: [
                wire.field1,
                wire.field2,
                wire.field3,
                wire.field4,
                wire.field5,
                wire.field6,
                wire.field7,
                wire.field8,
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    name: Option<String>,
    field1: Option<String>,
    field2: Option<String>,
    field3: Option<String>,
    field4: Option<String>,
    field5: Option<String>,
    field6: Option<String>,
    field7: Option<String>,
    field8: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireHistory {
    channel: WireChannel,
    feeds: Vec<WireFeed>,
}

/// Recent entries for one field, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHistory {
    pub channel_name: Option<String>,
    pub field_name: Option<String>,
    pub readings: Vec<Reading>,
}

/// ThingSpeak REST client
#[derive(Debug, Clone)]
pub struct ThingSpeakClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl ThingSpeakClient {
    /// Create a new client against `base_url` (e.g. `https://api.thingspeak.com`)
    pub fn new(base_url: &str, http_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| MonitorError::Config(format!("invalid base url {}: {}", base_url, e)))?;

        if base_url.cannot_be_a_base() {
            return Err(MonitorError::Config(format!("{} cannot be used as a base url", base_url)));
        }

        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("field_monitor/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MonitorError::Http)?;

        Ok(Self {
            client,
            base_url,
            timeout: http_timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, url: Url, query: &[(&str, String)]) -> std::result::Result<Response, FetchError> {
        debug!("GET {}", url);

        let response = self.client.get(url).query(query).send().await?;
        Self::check_status(response)
    }

    fn check_status(response: Response) -> std::result::Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            400 => warn!("Bad request for {}", response.url()),
            401 | 403 => warn!("Channel rejected credentials: {}", response.url()),
            404 => warn!("Channel or field not found: {}", response.url()),
            429 => warn!("Rate limited by remote"),
            500..=599 => warn!("Remote server error {}", status),
            _ => warn!("Unexpected response {}", status),
        }

        Err(FetchError::HttpStatus(status.as_u16()))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(response: Response) -> std::result::Result<T, FetchError> {
        // ThingSpeak answers `-1` with status 200 for unknown or private channels.
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            FetchError::Parse(format!("{} (body: {})", e, truncate(&body, 64)))
        })
    }

    /// Fetch the last `results` entries of a channel, narrowed to one field
    pub async fn fetch_history(
        &self,
        channel_id: &str,
        field: FieldIndex,
        api_key: Option<&str>,
        results: u32,
    ) -> std::result::Result<ChannelHistory, FetchError> {
        let url = self.endpoint(&["channels", channel_id, "feeds.json"]);
        let mut query = vec![("results", results.to_string())];
        if let Some(key) = api_key {
            query.push(("api_key", key.to_string()));
        }

        let response = self.get(url, &query).await?;
        let history: WireHistory = Self::read_json(response).await?;

        let field_names = [
            history.channel.field1,
            history.channel.field2,
            history.channel.field3,
            history.channel.field4,
            history.channel.field5,
            history.channel.field6,
            history.channel.field7,
            history.channel.field8,
        ];

        let readings = history
            .feeds
            .into_iter()
            .map(|wire| Feed::from(wire).reading(field))
            .collect();

        Ok(ChannelHistory {
            channel_name: history.channel.name,
            field_name: field_names[field.slot()].clone(),
            readings,
        })
    }
}

#[async_trait]
impl ValueFetcher for ThingSpeakClient {
    async fn fetch_latest(
        &self,
        channel_id: &str,
        field: FieldIndex,
        api_key: Option<&str>,
    ) -> std::result::Result<Reading, FetchError> {
        let field_segment = field.to_string();
        let url = self.endpoint(&["channels", channel_id, "fields", &field_segment, "last.json"]);
        let query: Vec<(&str, String)> = api_key
            .map(|key| vec![("api_key", key.to_string())])
            .unwrap_or_default();

        let response = self.get(url, &query).await?;
        let feed: Feed = Self::read_json::<WireFeed>(response).await?.into();

        debug!(
            "Channel {} field {} entry {} = {:?}",
            channel_id,
            field,
            feed.entry_id,
            feed.field(field)
        );

        Ok(feed.reading(field))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn field(n: u8) -> FieldIndex {
        FieldIndex::new(n).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = ThingSpeakClient::new("https://api.thingspeak.com", Duration::from_secs(10));
        assert!(client.is_ok());
        assert_eq!(client.unwrap().timeout(), Duration::from_secs(10));

        assert!(ThingSpeakClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_endpoint_escapes_channel_id() {
        let client = ThingSpeakClient::new("http://localhost:9000/api/", Duration::from_secs(1)).unwrap();
        let url = client.endpoint(&["channels", "12/34", "feeds.json"]);
        assert_eq!(url.as_str(), "http://localhost:9000/api/channels/12%2F34/feeds.json");
    }

    #[tokio::test]
    async fn test_fetch_latest_reads_selected_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/123/fields/2/last.json"))
            .and(query_param("api_key", "READKEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created_at": "2026-10-19T10:00:00Z",
                "entry_id": 881,
                "field2": "35.25"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let reading = client.fetch_latest("123", field(2), Some("READKEY")).await.unwrap();

        assert_eq!(reading.entry_id, 881);
        assert_eq!(reading.value, Some(35.25));
        assert_eq!(reading.observed_at.to_rfc3339(), "2026-10-19T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_fetch_latest_null_field_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/5/fields/1/last.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created_at": "2026-10-19T10:00:00Z",
                "entry_id": 1,
                "field1": null
            })))
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let reading = client.fetch_latest("5", field(1), None).await.unwrap();
        assert_eq!(reading.raw, None);
        assert_eq!(reading.value, None);
    }

    #[tokio::test]
    async fn test_fetch_latest_maps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.fetch_latest("404", field(1), None).await.unwrap_err();
        assert_eq!(err, FetchError::HttpStatus(404));
    }

    #[tokio::test]
    async fn test_fetch_latest_private_channel_body_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("-1"))
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.fetch_latest("1", field(1), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[tokio::test]
    async fn test_fetch_latest_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_millis(50)).unwrap();
        let err = client.fetch_latest("1", field(1), None).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
    }

    #[tokio::test]
    async fn test_fetch_latest_connection_refused_is_network_error() {
        let client = ThingSpeakClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.fetch_latest("1", field(1), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/77/feeds.json"))
            .and(query_param("results", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "channel": {"id": 77, "name": "Greenhouse", "field1": "Temperature", "field3": "Humidity"},
                "feeds": [
                    {"created_at": "2026-10-19T09:00:00Z", "entry_id": 1, "field3": "40"},
                    {"created_at": "2026-10-19T09:15:00Z", "entry_id": 2, "field3": null},
                    {"created_at": "2026-10-19T09:30:00Z", "entry_id": 3, "field3": "42.5"}
                ]
            })))
            .mount(&server)
            .await;

        let client = ThingSpeakClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let history = client.fetch_history("77", field(3), None, 3).await.unwrap();

        assert_eq!(history.channel_name.as_deref(), Some("Greenhouse"));
        assert_eq!(history.field_name.as_deref(), Some("Humidity"));
        let values: Vec<Option<f64>> = history.readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![Some(40.0), None, Some(42.5)]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
