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

//! Status API: latest distribution per entry and the relay services.

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use fluxion_surplus_core::{DistributionBoard, EntrySnapshot, RelayTarget, SurplusEntry};
use fluxion_surplus_types::RelayMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared state of the status API
#[derive(Clone, Debug)]
pub struct WebState {
    pub board: DistributionBoard,
    pub entries: Arc<Vec<Arc<SurplusEntry>>>,
}

/// Which devices a relay request addresses
///
/// `entity_id` wins over `device_id`; with neither, every device of the
/// selected entries (or of all entries) is addressed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaySelector {
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RelayModeRequest {
    pub mode: RelayMode,
    #[serde(flatten)]
    pub selector: RelaySelector,
}

#[derive(Debug, Deserialize)]
pub struct RelayPowerRequest {
    pub percent: f64,
    #[serde(flatten)]
    pub selector: RelaySelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayResponse {
    /// Number of entities the command was applied to
    pub applied: usize,
}

type ApiError = (StatusCode, String);

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/distribution", get(distribution_handler))
        .route("/api/entries/{entry_id}", get(entry_handler))
        .route("/api/relay-mode", post(relay_mode_handler))
        .route("/api/relay-power", post(relay_power_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the status API until the listener fails
pub async fn serve(state: WebState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    info!("🌐 Starting web server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn distribution_handler(State(state): State<WebState>) -> Json<Vec<EntrySnapshot>> {
    Json(state.board.all())
}

async fn entry_handler(
    State(state): State<WebState>,
    Path(entry_id): Path<String>,
) -> Result<Json<EntrySnapshot>, ApiError> {
    state
        .board
        .snapshot(&entry_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Entry '{entry_id}' not found")))
}

async fn relay_mode_handler(
    State(state): State<WebState>,
    Json(request): Json<RelayModeRequest>,
) -> Result<Json<RelayResponse>, ApiError> {
    let mut applied = 0;
    for (entry, target) in resolve(&state, &request.selector)? {
        applied += entry
            .set_relay_mode(target.as_target(), request.mode)
            .await
            .map_err(bad_request)?;
    }
    info!("Relay mode '{}' applied to {} entities", request.mode, applied);
    Ok(Json(RelayResponse { applied }))
}

async fn relay_power_handler(
    State(state): State<WebState>,
    Json(request): Json<RelayPowerRequest>,
) -> Result<Json<RelayResponse>, ApiError> {
    if !request.percent.is_finite() {
        return Err((StatusCode::BAD_REQUEST, "percent must be a number".to_owned()));
    }

    let mut applied = 0;
    for (entry, target) in resolve(&state, &request.selector)? {
        applied += entry
            .set_relay_power(target.as_target(), request.percent)
            .await
            .map_err(bad_request)?;
    }
    info!("Relay power {:.0}% applied to {} entities", request.percent, applied);
    Ok(Json(RelayResponse { applied }))
}

/// Owned form of [`RelayTarget`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum OwnedTarget {
    Entity(String),
    Device(String),
    All,
}

impl OwnedTarget {
    fn as_target(&self) -> RelayTarget<'_> {
        match self {
            Self::Entity(entity_id) => RelayTarget::Entity(entity_id),
            Self::Device(device_id) => RelayTarget::Device(device_id),
            Self::All => RelayTarget::All,
        }
    }
}

fn resolve(
    state: &WebState,
    selector: &RelaySelector,
) -> Result<Vec<(Arc<SurplusEntry>, OwnedTarget)>, ApiError> {
    let candidates: Vec<&Arc<SurplusEntry>> = match &selector.entry_id {
        Some(entry_id) => {
            let entry = state
                .entries
                .iter()
                .find(|e| e.id() == entry_id)
                .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Entry '{entry_id}' not found")))?;
            vec![entry]
        }
        None => state.entries.iter().collect(),
    };

    if let Some(entity_id) = &selector.entity_id {
        let owner = candidates
            .iter()
            .find(|entry| owns_entity(entry, entity_id))
            .or_else(|| candidates.first())
            .ok_or_else(|| (StatusCode::NOT_FOUND, "No entries configured".to_owned()))?;
        return Ok(vec![((*owner).clone(), OwnedTarget::Entity(entity_id.clone()))]);
    }

    if let Some(device_id) = &selector.device_id {
        let owners: Vec<_> = candidates
            .into_iter()
            .filter(|entry| entry.config().device(device_id).is_some())
            .map(|entry| (entry.clone(), OwnedTarget::Device(device_id.clone())))
            .collect();
        if owners.is_empty() {
            return Err((
                StatusCode::NOT_FOUND,
                format!("Device with ID {device_id} not found"),
            ));
        }
        return Ok(owners);
    }

    Ok(candidates
        .into_iter()
        .map(|entry| (entry.clone(), OwnedTarget::All))
        .collect())
}

fn owns_entity(entry: &SurplusEntry, entity_id: &str) -> bool {
    entry.config().devices.iter().any(|device| {
        device.mode_select_entity.as_deref() == Some(entity_id)
            || device
                .entity
                .as_deref()
                .and_then(|e| e.split('|').next())
                .is_some_and(|e| e.trim() == entity_id)
    })
}

fn bad_request(error: anyhow::Error) -> ApiError {
    warn!("⚠️ Relay request rejected: {:#}", error);
    (StatusCode::BAD_REQUEST, format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Utc;
    use fluxion_surplus_core::{AllocationObserver, EntityController, ManualClock};
    use fluxion_surplus_types::{
        AllocationResult, DeviceAction, DeviceCommand, DeviceConfig, DeviceKind, EntityState,
        EntryConfig, SensorConfig,
    };
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingController {
        states: Mutex<HashMap<String, String>>,
        commands: Mutex<Vec<DeviceCommand>>,
    }

    #[async_trait]
    impl EntityController for RecordingController {
        async fn read_state(&self, entity_id: &str) -> anyhow::Result<EntityState> {
            self.states
                .lock()
                .get(entity_id)
                .map(|state| EntityState::new(entity_id, state.clone()))
                .ok_or_else(|| anyhow::anyhow!("Entity not found: {entity_id}"))
        }

        async fn execute(&self, command: &DeviceCommand) -> anyhow::Result<()> {
            if let DeviceAction::SelectOption(option) = &command.action {
                self.states
                    .lock()
                    .insert(command.entity_id.clone(), option.clone());
            }
            self.commands.lock().push(command.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn state() -> (WebState, Arc<RecordingController>) {
        let controller = Arc::new(RecordingController::default());
        controller.states.lock().extend([
            ("select.boiler_mode".to_owned(), "off".to_owned()),
            ("light.boiler".to_owned(), "off".to_owned()),
        ]);

        let mut boiler = DeviceConfig::new("boiler", "Boiler");
        boiler.entity = Some("light.boiler".to_owned());
        boiler.mode_select_entity = Some("select.boiler_mode".to_owned());
        boiler.kind = DeviceKind::Proportional;
        boiler.max_expected_w = Some(2000.0);

        let mut config = EntryConfig::new(
            "roof",
            SensorConfig {
                pv_power: "sensor.pv_power".to_owned(),
                ..SensorConfig::default()
            },
        );
        config.devices.push(boiler);

        let board = DistributionBoard::new();
        board.register("roof");

        let entry = SurplusEntry::new(
            config,
            chrono_tz::UTC,
            controller.clone(),
            Arc::new(board.clone()),
            Arc::new(ManualClock::new(Utc::now())),
        );

        let state = WebState {
            board,
            entries: Arc::new(vec![Arc::new(entry)]),
        };
        (state, controller)
    }

    async fn send(state: WebState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_distribution_and_entry_snapshot() {
        let (state, _) = state();
        state
            .board
            .publish_allocation("roof", &AllocationResult::empty(750.0, Utc::now()));

        let request = Request::builder()
            .uri("/api/distribution")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        let all: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(all[0]["entry_id"], "roof");
        assert_eq!(all[0]["allocation"]["total_power"], 750.0);

        let request = Request::builder()
            .uri("/api/entries/roof")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .uri("/api/entries/garage")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_relay_mode_by_device() {
        let (state, controller) = state();
        let request = post_json(
            "/api/relay-mode",
            &json!({"mode": "proportional", "device_id": "boiler"}),
        );
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
        let response: RelayResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.applied, 1);

        let commands = controller.commands.lock();
        assert_eq!(
            commands[0],
            DeviceCommand::select_mode("select.boiler_mode", RelayMode::Proportional)
        );
    }

    #[tokio::test]
    async fn test_relay_power_by_entity_and_unknown_device() {
        let (state, controller) = state();
        let request = post_json(
            "/api/relay-power",
            &json!({"percent": 40, "entity_id": "light.boiler"}),
        );
        let (status, body) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["applied"], 1);
        assert_eq!(
            controller.commands.lock()[0].action,
            DeviceAction::SetPercent(40.0)
        );

        let request = post_json(
            "/api/relay-power",
            &json!({"percent": 40, "device_id": "heater"}),
        );
        let (status, _) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = post_json(
            "/api/relay-mode",
            &json!({"mode": "boost", "device_id": "boiler"}),
        );
        let (status, _) = send(state, request).await;
        assert!(status.is_client_error());
    }
}
