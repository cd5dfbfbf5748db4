//! Image generation through the CES-Image HTTP API.

use super::{ImageGenerator, ServiceError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    image_url: Option<String>,
}

/// CES-Image API client.
pub struct CesImageClient {
    client: Client,
    url: String,
}

impl CesImageClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ImageGenerator for CesImageClient {
    async fn generate_image(&self, prompt: &str) -> Result<String, ServiceError> {
        debug!("Requesting image from {}", self.url);
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(&self.url)
            .json(&ImageRequest { prompt })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Api(format!("HTTP {}", status.as_u16())));
        }

        let body: ImageResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let url = body
            .image_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ServiceError::InvalidResponse("no image in response".into()))?;

        info!("Image generated in {}ms", start.elapsed().as_millis());
        Ok(url)
    }
}
