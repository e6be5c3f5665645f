use crate::prelude::*;

use url::Url;

use crate::config::SensorSource;

/// Client for the Home Assistant states REST API. The pilot reads grid
/// power and power-factor sensors through this.
#[derive(Clone, Debug)]
pub struct StatesClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl StatesClient {
    pub fn new(source: &SensorSource) -> Result<Self> {
        let base_url = Url::parse(source.base_url()).map_err(|err| {
            file_error_with_source!(err, "invalid sensor source url {}", source.base_url())
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token: source.token().to_string(),
        })
    }

    /// Raw state string for an entity. `None` for entities that do not
    /// exist or report unknown/unavailable.
    pub async fn state(&self, entity_id: &str) -> Result<Option<String>> {
        let url = self
            .base_url
            .join(&format!("api/states/{}", entity_id))
            .map_err(|err| anyhow!("cannot build state url for {}: {}", entity_id, err))?;

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| anyhow!("sensor request to {} failed: {}", url, err))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("sensor {} does not exist", entity_id);
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("sensor request to {} returned {}", url, response.status());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| anyhow!("sensor response from {} unparseable: {}", url, err))?;

        let state = body
            .get("state")
            .and_then(|state| state.as_str())
            .map(str::to_string);

        Ok(state.filter(|state| state != "unknown" && state != "unavailable"))
    }

    /// State parsed as a number, `None` when absent or non-numeric.
    pub async fn numeric_state(&self, entity_id: &str) -> Result<Option<f64>> {
        Ok(self
            .state(entity_id)
            .await?
            .and_then(|state| state.parse().ok()))
    }
}
