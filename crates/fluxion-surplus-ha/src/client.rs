// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use crate::errors::{HaError, HaResult};
use crate::types::HaEntityState;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const DEFAULT_BASE_URL: &str = "http://localhost:8123";
const SUPERVISOR_BASE_URL: &str = "http://supervisor/core";

/// Home Assistant REST API client
///
/// Every request carries a 10 second timeout, so a hung Home Assistant never
/// blocks a caller for longer than the retry budget.
#[derive(Debug, Clone)]
pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> HaResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HaError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
            client,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Client for the add-on environment (SUPERVISOR_TOKEN)
    pub fn from_supervisor() -> HaResult<Self> {
        let token = std::env::var("SUPERVISOR_TOKEN").map_err(|_| {
            HaError::ConfigError(
                "SUPERVISOR_TOKEN environment variable not set. Are you running as an HA addon?"
                    .to_owned(),
            )
        })?;

        info!("Initializing HA client using Supervisor API");
        Self::new(SUPERVISOR_BASE_URL, token)
    }

    /// Client from HA_BASE_URL and HA_TOKEN
    pub fn from_env() -> HaResult<Self> {
        Self::from_config(None, None)
    }

    /// Configured values first, then HA_BASE_URL/HA_TOKEN, then the supervisor
    pub fn from_config(base_url: Option<String>, token: Option<String>) -> HaResult<Self> {
        let token = token.or_else(|| std::env::var("HA_TOKEN").ok());
        let Some(token) = token else {
            if std::env::var("SUPERVISOR_TOKEN").is_ok() {
                return Self::from_supervisor();
            }
            return Err(HaError::ConfigError(
                "HA token not found in config or HA_TOKEN environment variable".to_owned(),
            ));
        };

        let base_url = base_url
            .or_else(|| std::env::var("HA_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());

        info!("Initializing HA client: {}", base_url);
        Self::new(base_url, token)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Override retry attempts and the initial backoff delay
    pub fn with_retry_config(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Get the state of one entity
    pub async fn get_state(&self, entity_id: &str) -> HaResult<HaEntityState> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        debug!("🔍 [HA QUERY] {}", entity_id);

        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::OK => {
                let state = response.json::<HaEntityState>().await?;
                trace!("   {} = '{}' {:?}", entity_id, state.state, state.attributes);
                Ok(state)
            }
            StatusCode::NOT_FOUND => {
                debug!("❌ [HA QUERY] Entity not found: {}", entity_id);
                Err(HaError::EntityNotFound(entity_id.to_owned()))
            }
            _ => Err(Self::failure(response, entity_id).await),
        }
    }

    /// Call a service given as "domain.service"
    pub async fn call_service(&self, service: &str, data: Value) -> HaResult<()> {
        let Some((domain, name)) = service
            .split_once('.')
            .filter(|(d, n)| !d.is_empty() && !n.is_empty() && !n.contains('.'))
        else {
            error!("❌ [HA SERVICE] Invalid service format: {}", service);
            return Err(HaError::ServiceCallFailed {
                service: service.to_owned(),
                reason: "Invalid service format, expected 'domain.service'".to_owned(),
            });
        };

        let url = format!("{}/api/services/{}/{}", self.base_url, domain, name);
        info!("📞 [HA SERVICE] {} {}", service, data);

        let response = self
            .retry_request(|| async {
                self.client
                    .post(&url)
                    .bearer_auth(&self.token)
                    .json(&data)
                    .send()
                    .await
            })
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("✅ [HA SERVICE] {}", service);
            return Ok(());
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            error!("❌ [HA SERVICE] Authentication failed for: {}", service);
            return Err(HaError::AuthenticationFailed);
        }

        let reason = response.text().await.unwrap_or_default();
        error!("❌ [HA SERVICE] {} failed (status {}): {}", service, status, reason);
        Err(HaError::ServiceCallFailed {
            service: service.to_owned(),
            reason,
        })
    }

    /// Health check; connection failures count as unhealthy, not as errors
    pub async fn ping(&self) -> HaResult<bool> {
        let url = format!("{}/api/", self.base_url);

        match self.client.get(&url).bearer_auth(&self.token).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!("Health check failed: status {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Home Assistant core configuration
    pub async fn get_config(&self) -> HaResult<Value> {
        let url = format!("{}/api/config", self.base_url);
        let response = self.get(&url).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json::<Value>().await?),
            _ => Err(Self::failure(response, "config").await),
        }
    }

    /// IANA timezone Home Assistant is configured with
    pub async fn get_timezone(&self) -> HaResult<String> {
        let config = self.get_config().await?;
        let timezone = config
            .get("time_zone")
            .and_then(Value::as_str)
            .ok_or_else(|| HaError::InvalidResponse("time_zone missing from HA config".to_owned()))?;

        info!("🌍 Home Assistant timezone: {}", timezone);
        Ok(timezone.to_owned())
    }

    async fn get(&self, url: &str) -> HaResult<Response> {
        self.retry_request(|| async { self.client.get(url).bearer_auth(&self.token).send().await })
            .await
    }

    async fn failure(response: Response, what: &str) -> HaError {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!("❌ [HA ERROR] Authentication failed reading {}", what);
                HaError::AuthenticationFailed
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                error!("❌ [HA ERROR] {} returned status {}: {}", what, status, message);
                HaError::ApiError {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }

    /// Retry transport failures with exponential backoff
    async fn retry_request<F, Fut>(&self, mut request_fn: F) -> HaResult<Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut attempts = 0;
        let mut delay = self.retry_delay;

        loop {
            attempts += 1;
            match request_fn().await {
                Ok(response) => return Ok(response),
                Err(e) if attempts >= self.max_retries => {
                    warn!("Request failed after {} attempts: {}", attempts, e);
                    return Err(HaError::HttpError(e));
                }
                Err(e) => {
                    debug!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempts, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn state_body(entity_id: &str, state: &str) -> String {
        json!({
            "entity_id": entity_id,
            "state": state,
            "attributes": {},
            "last_changed": "2025-06-02T10:00:00+00:00",
            "last_updated": "2025-06-02T10:00:00+00:00"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_get_state_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.pv_power")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(state_body("sensor.pv_power", "1234.5"))
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        let state = client.get_state("sensor.pv_power").await.unwrap();

        assert_eq!(state.entity_id, "sensor.pv_power");
        assert_eq!(state.state, "1234.5");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_state_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/switch.missing")
            .with_status(404)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        let result = client.get_state("switch.missing").await;

        assert!(matches!(result, Err(HaError::EntityNotFound(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_state_unauthorized() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/states/sensor.pv_power")
            .with_status(401)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "bad_token").unwrap();
        let result = client.get_state("sensor.pv_power").await;
        assert!(matches!(result, Err(HaError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_call_service_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/switch/turn_on")
            .match_header("authorization", "Bearer test_token")
            .match_body(Matcher::Json(json!({"entity_id": "switch.boiler"})))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        client
            .call_service("switch.turn_on", json!({"entity_id": "switch.boiler"}))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_service_failure_carries_reason() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/services/light/turn_on")
            .with_status(400)
            .with_body("bad brightness")
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        let result = client
            .call_service("light.turn_on", json!({"entity_id": "light.boiler"}))
            .await;

        match result {
            Err(HaError::ServiceCallFailed { service, reason }) => {
                assert_eq!(service, "light.turn_on");
                assert_eq!(reason, "bad brightness");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_service_invalid_format() {
        let client = HomeAssistantClient::new("http://localhost", "token").unwrap();
        for service in ["invalid", "switch.", "a.b.c"] {
            let result = client.call_service(service, json!({})).await;
            assert!(matches!(result, Err(HaError::ServiceCallFailed { .. })), "{service}");
        }
    }

    #[tokio::test]
    async fn test_ping_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .create_async()
            .await;

        let client = HomeAssistantClient::new(format!("{}/", server.url()), "test_token").unwrap();
        assert!(client.ping().await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        let client = HomeAssistantClient::new("http://127.0.0.1:9", "token")
            .unwrap()
            .with_retry_config(2, Duration::from_millis(1));

        let result = client.get_state("sensor.pv_power").await;
        assert!(matches!(result, Err(HaError::HttpError(_))));
        assert!(!client.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_timezone() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/config")
            .with_status(200)
            .with_body(json!({"time_zone": "Europe/Prague", "version": "2025.6.0"}).to_string())
            .create_async()
            .await;

        let client = HomeAssistantClient::new(server.url(), "test_token").unwrap();
        assert_eq!(client.get_timezone().await.unwrap(), "Europe/Prague");
    }
}
