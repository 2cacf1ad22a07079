//! HTTP League Data Adapter
//!
//! Implements the [`PhaseFeed`] and [`UpstreamFetcher`] ports against a JSON
//! REST API laid out as `/state/{sport}`, `/players/{sport}`,
//! `/league/{id}/rosters` and so on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::duration_secs;
use crate::domain::ports::{LeaguePhase, PhaseFeed, UpstreamFetcher};
use crate::error::{Error, Result};

/// Default public API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.sleeper.app/v1";

/// HTTP adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFeedConfig {
    pub base_url: String,
    /// Sport whose state drives the league phase
    pub sport: String,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for HttpFeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            sport: "nfl".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// JSON REST client for league data
pub struct HttpLeagueClient {
    config: HttpFeedConfig,
    client: Client,
}

impl HttpLeagueClient {
    pub fn new(config: HttpFeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpFeedConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    #[instrument(skip(self))]
    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Feed(format!(
                "GET {} failed with status: {}",
                path,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

impl std::fmt::Debug for HttpLeagueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLeagueClient")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

/// Parse a `/state/{sport}` body into a phase snapshot
pub fn parse_phase(body: Value) -> Result<LeaguePhase> {
    serde_json::from_value(body).map_err(|e| Error::Feed(format!("Invalid state payload: {}", e)))
}

#[async_trait]
impl PhaseFeed for HttpLeagueClient {
    async fn current_phase(&self) -> Result<LeaguePhase> {
        let body = self.get_json(&format!("/state/{}", self.config.sport)).await?;
        parse_phase(body)
    }
}

#[async_trait]
impl UpstreamFetcher for HttpLeagueClient {
    async fn fetch_state(&self, sport: &str) -> anyhow::Result<Value> {
        Ok(self.get_json(&format!("/state/{}", sport)).await?)
    }

    async fn fetch_players(&self, sport: &str) -> anyhow::Result<Value> {
        Ok(self.get_json(&format!("/players/{}", sport)).await?)
    }

    async fn fetch_trending(&self, sport: &str, kind: &str) -> anyhow::Result<Value> {
        Ok(self
            .get_json(&format!("/players/{}/trending/{}", sport, kind))
            .await?)
    }

    async fn fetch_league(&self, league_id: &str) -> anyhow::Result<Value> {
        Ok(self.get_json(&format!("/league/{}", league_id)).await?)
    }

    async fn fetch_rosters(&self, league_id: &str) -> anyhow::Result<Value> {
        Ok(self.get_json(&format!("/league/{}/rosters", league_id)).await?)
    }

    async fn fetch_users(&self, league_id: &str) -> anyhow::Result<Value> {
        Ok(self.get_json(&format!("/league/{}/users", league_id)).await?)
    }

    async fn fetch_matchups(&self, league_id: &str, week: u32) -> anyhow::Result<Value> {
        Ok(self
            .get_json(&format!("/league/{}/matchups/{}", league_id, week))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SeasonPhase;
    use serde_json::json;

    #[test]
    fn test_url_joining() {
        let client = HttpLeagueClient::new(HttpFeedConfig {
            base_url: "http://localhost:8000/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.url("/state/nfl"), "http://localhost:8000/v1/state/nfl");
    }

    #[test]
    fn test_parse_phase_from_state_payload() {
        let body = json!({
            "week": 10,
            "season_type": "regular",
            "season": "2024",
            "display_week": 10,
            "leg": 10
        });
        let phase = parse_phase(body).unwrap();
        assert_eq!(phase, LeaguePhase::new(SeasonPhase::Regular, 10));

        let err = parse_phase(json!({"week": "ten"})).unwrap_err();
        assert!(matches!(err, Error::Feed(_)));
    }

    #[tokio::test]
    async fn test_unreachable_feed_errors() {
        let client = HttpLeagueClient::new(HttpFeedConfig {
            base_url: "http://localhost:19999".to_string(),
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();

        let result = client.current_phase().await;
        assert!(matches!(result, Err(Error::Http(_))));
        assert!(client.fetch_players("nfl").await.is_err());
    }
}
