//! Current weather from wttr.in.

use super::{ServiceError, WeatherService};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// wttr.in client returning the one-line `format=3` summary.
pub struct WttrWeather {
    client: Client,
    base_url: String,
    language: String,
}

impl WttrWeather {
    pub fn new(base_url: impl Into<String>, language: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            language: language.into(),
        }
    }

    fn location_url(&self, location: &str) -> Result<reqwest::Url, ServiceError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ServiceError::Unavailable(format!("bad weather URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Unavailable("weather URL cannot have a path".into()))?
            .pop_if_empty()
            .push(location.trim());
        Ok(url)
    }
}

#[async_trait]
impl WeatherService for WttrWeather {
    async fn current(&self, location: &str) -> Result<String, ServiceError> {
        let url = self.location_url(location)?;
        debug!("Fetching weather: {}", url);

        let response = self
            .client
            .get(url)
            .query(&[("format", "3"), ("lang", self.language.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Api(format!("HTTP {}", status.as_u16())));
        }

        let text = response.text().await?.trim().to_string();
        if text.is_empty() || text.starts_with("Unknown location") {
            return Err(ServiceError::InvalidResponse(format!(
                "unknown location '{}'",
                location
            )));
        }

        Ok(text)
    }
}
