use crate::config::MackerelConfig;
use crate::error::ForwarderError;
use crate::reading::{MeterReading, Sample};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

/// One Mackerel service metric data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    /// Unix seconds
    pub time: i64,
    pub value: f64,
}

impl MetricPoint {
    fn from_sample(name: &str, sample: &Sample) -> Self {
        Self {
            name: name.to_string(),
            time: sample.timestamp.timestamp(),
            value: sample.value,
        }
    }
}

/// Data points for every reading that is currently defined, in a fixed order
pub fn metric_points(reading: &MeterReading) -> Vec<MetricPoint> {
    [
        ("power", reading.power),
        ("cumulative_energy", reading.cumulative_energy),
        ("energy", reading.energy_delta),
    ]
    .iter()
    .filter_map(|(name, sample)| sample.as_ref().map(|s| MetricPoint::from_sample(name, s)))
    .collect()
}

/// Posts readings to the Mackerel service metrics API
pub struct MackerelClient {
    endpoint_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl MackerelClient {
    pub fn new(config: &MackerelConfig) -> Self {
        Self {
            endpoint_url: format!(
                "{}/api/v0/services/{}/tsdb",
                config.base_url, config.service
            ),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Returns `Ok(false)` when forwarding is disabled or there is nothing to send
    pub async fn send_reading(&self, reading: &MeterReading) -> Result<bool, ForwarderError> {
        let Some(api_key) = &self.api_key else {
            return Ok(false);
        };
        let points = metric_points(reading);
        if points.is_empty() {
            debug!("No readings to send to Mackerel yet");
            return Ok(false);
        }
        info!("Send energy: {points:?}");
        self.post_service_metrics(api_key, &points).await?;
        Ok(true)
    }

    async fn post_service_metrics(
        &self,
        api_key: &str,
        points: &[MetricPoint],
    ) -> Result<(), ForwarderError> {
        let response = self
            .client
            .post(&self.endpoint_url)
            .header("X-Api-Key", api_key)
            .json(points)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwarderError::Rejected { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_mackerel_client {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use serde_json::json;

    fn config(base_url: &str, api_key: Option<&str>) -> MackerelConfig {
        MackerelConfig {
            api_key: api_key.map(str::to_string),
            base_url: base_url.to_string(),
            service: "rasberrypi".to_string(),
        }
    }

    fn full_reading() -> MeterReading {
        MeterReading {
            power: Some(Sample::new(
                1200.0,
                Utc.with_ymd_and_hms(2024, 1, 15, 3, 31, 10).unwrap(),
            )),
            cumulative_energy: Some(Sample::new(
                10.5,
                Utc.with_ymd_and_hms(2024, 1, 15, 3, 30, 0).unwrap(),
            )),
            previous_cumulative_energy: Some(Sample::new(
                10.0,
                Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap(),
            )),
            energy_delta: Some(Sample::new(
                0.5,
                Utc.with_ymd_and_hms(2024, 1, 15, 3, 30, 0).unwrap(),
            )),
        }
    }

    #[test]
    fn test_metric_points_order_and_times() {
        let points = metric_points(&full_reading());
        assert_eq!(
            points,
            vec![
                MetricPoint {
                    name: "power".to_string(),
                    time: 1705289470,
                    value: 1200.0
                },
                MetricPoint {
                    name: "cumulative_energy".to_string(),
                    time: 1705289400,
                    value: 10.5
                },
                MetricPoint {
                    name: "energy".to_string(),
                    time: 1705289400,
                    value: 0.5
                },
            ]
        );
    }

    #[test]
    fn test_metric_points_skip_undefined_values() {
        let mut reading = full_reading();
        reading.energy_delta = None;
        reading.power = None;
        let names: Vec<String> = metric_points(&reading).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["cumulative_energy"]);

        assert!(metric_points(&MeterReading::default()).is_empty());
    }

    #[test]
    fn test_metric_points_keep_zero_delta() {
        let mut reading = full_reading();
        reading.energy_delta = Some(Sample::new(0.0, Utc::now()));
        let points = metric_points(&reading);
        let energy = points.iter().find(|p| p.name == "energy").unwrap();
        assert_eq!(energy.value, 0.0);
    }

    #[tokio::test]
    async fn test_send_reading_posts_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v0/services/rasberrypi/tsdb")
            .match_header("X-Api-Key", "test_key")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!([
                {"name": "power", "time": 1705289470, "value": 1200.0},
                {"name": "cumulative_energy", "time": 1705289400, "value": 10.5},
                {"name": "energy", "time": 1705289400, "value": 0.5}
            ])))
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .create_async()
            .await;

        let client = MackerelClient::new(&config(&server.url(), Some("test_key")));
        let sent = client.send_reading(&full_reading()).await.unwrap();

        assert!(sent);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_reading_without_api_key_is_noop() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = MackerelClient::new(&config(&server.url(), None));
        assert!(!client.is_enabled());
        let sent = client.send_reading(&full_reading()).await.unwrap();

        assert!(!sent);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_reading_with_nothing_defined_is_noop() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = MackerelClient::new(&config(&server.url(), Some("test_key")));
        let sent = client.send_reading(&MeterReading::default()).await.unwrap();

        assert!(!sent);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_reading_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v0/services/rasberrypi/tsdb")
            .with_status(403)
            .with_body(r#"{"error": {"message": "Forbidden"}}"#)
            .create_async()
            .await;

        let client = MackerelClient::new(&config(&server.url(), Some("bad_key")));
        let result = client.send_reading(&full_reading()).await;

        match result {
            Err(ForwarderError::Rejected { status, body }) => {
                assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
                assert!(body.contains("Forbidden"));
            }
            other => panic!("Expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_reading_unreachable() {
        let client = MackerelClient::new(&config("http://127.0.0.1:1", Some("test_key")));
        let result = client.send_reading(&full_reading()).await;
        assert!(matches!(result, Err(ForwarderError::Http(_))));
    }
}
