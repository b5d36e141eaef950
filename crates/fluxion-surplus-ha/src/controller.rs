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

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use fluxion_surplus_core::EntityController;
use fluxion_surplus_types::control::DEFAULT_HVAC_MODE;
use fluxion_surplus_types::{DeviceAction, DeviceCommand, EntityDomain, EntityState};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::client::HomeAssistantClient;

/// Brightness HA lights are switched on with
pub const MAX_BRIGHTNESS: u8 = 255;

/// Brightness value for a power percent; HA lights take 0-255
pub fn brightness_for_percent(percent: f64) -> u8 {
    (percent.clamp(0.0, 100.0) / 100.0 * 255.0).floor() as u8
}

/// [`EntityController`] backed by Home Assistant services
#[derive(Debug, Clone)]
pub struct HomeAssistantEntityController {
    client: Arc<HomeAssistantClient>,
}

impl HomeAssistantEntityController {
    pub fn new(client: Arc<HomeAssistantClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<HomeAssistantClient> {
        &self.client
    }

    /// Service name and payload for a command
    fn service_call(command: &DeviceCommand) -> Result<(String, Value)> {
        let entity_id = command.entity_id.as_str();

        if let DeviceAction::SelectOption(option) = &command.action {
            return Ok((
                "select.select_option".to_owned(),
                json!({"entity_id": entity_id, "option": option}),
            ));
        }

        let Some(domain) = command.domain else {
            bail!("No controllable domain for {entity_id}");
        };

        let switch_on = matches!(command.action, DeviceAction::Activate)
            || matches!(command.action, DeviceAction::SetPercent(p) if p > 0.0);

        let call = match (domain, switch_on) {
            (EntityDomain::Climate, true) => (
                "climate.set_hvac_mode".to_owned(),
                json!({
                    "entity_id": entity_id,
                    "hvac_mode": command.hvac_mode.as_deref().unwrap_or(DEFAULT_HVAC_MODE),
                }),
            ),
            (EntityDomain::Climate, false) => (
                "climate.set_hvac_mode".to_owned(),
                json!({"entity_id": entity_id, "hvac_mode": "off"}),
            ),
            (EntityDomain::Light, true) => match command.action {
                DeviceAction::SetPercent(percent) => (
                    "light.turn_on".to_owned(),
                    json!({"entity_id": entity_id, "brightness": brightness_for_percent(percent)}),
                ),
                DeviceAction::Activate | DeviceAction::Deactivate | DeviceAction::SelectOption(_) => (
                    "light.turn_on".to_owned(),
                    json!({"entity_id": entity_id, "brightness": MAX_BRIGHTNESS}),
                ),
            },
            (
                EntityDomain::Light
                | EntityDomain::Switch
                | EntityDomain::InputBoolean
                | EntityDomain::Automation
                | EntityDomain::Script,
                on,
            ) => (
                format!("{}.{}", domain.as_str(), if on { "turn_on" } else { "turn_off" }),
                json!({"entity_id": entity_id}),
            ),
        };

        Ok(call)
    }
}

#[async_trait]
impl EntityController for HomeAssistantEntityController {
    async fn read_state(&self, entity_id: &str) -> Result<EntityState> {
        let state = self
            .client
            .get_state(entity_id)
            .await
            .with_context(|| format!("Failed to read entity: {entity_id}"))?;
        Ok(state.into())
    }

    async fn execute(&self, command: &DeviceCommand) -> Result<()> {
        let (service, data) = Self::service_call(command)?;
        debug!("📝 [CONTROL] {} via {}", command, service);

        self.client
            .call_service(&service, data)
            .await
            .with_context(|| format!("Failed to execute {command}"))
    }

    fn name(&self) -> &str {
        "HomeAssistant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxion_surplus_types::{CommandTarget, RelayMode};
    use mockito::{Matcher, Server};

    fn command(target: &str, action: DeviceAction) -> DeviceCommand {
        let target: CommandTarget = target.parse().unwrap();
        DeviceCommand::for_target(&target, action)
    }

    #[test]
    fn test_brightness_scaling() {
        assert_eq!(brightness_for_percent(100.0), 255);
        assert_eq!(brightness_for_percent(50.0), 127);
        assert_eq!(brightness_for_percent(5.0), 12);
        assert_eq!(brightness_for_percent(150.0), 255);
        assert_eq!(brightness_for_percent(-3.0), 0);
    }

    #[test]
    fn test_service_calls_per_domain() {
        let cases = [
            (
                command("switch.boiler", DeviceAction::Activate),
                "switch.turn_on",
                json!({"entity_id": "switch.boiler"}),
            ),
            (
                command("input_boolean.heat", DeviceAction::Deactivate),
                "input_boolean.turn_off",
                json!({"entity_id": "input_boolean.heat"}),
            ),
            (
                command("light.boiler", DeviceAction::SetPercent(40.0)),
                "light.turn_on",
                json!({"entity_id": "light.boiler", "brightness": 102}),
            ),
            (
                command("light.boiler", DeviceAction::Activate),
                "light.turn_on",
                json!({"entity_id": "light.boiler", "brightness": 255}),
            ),
            (
                command("light.boiler", DeviceAction::SetPercent(0.0)),
                "light.turn_off",
                json!({"entity_id": "light.boiler"}),
            ),
            (
                command("climate.tank", DeviceAction::Activate),
                "climate.set_hvac_mode",
                json!({"entity_id": "climate.tank", "hvac_mode": "heat"}),
            ),
            (
                command("climate.tank|auto", DeviceAction::SetPercent(60.0)),
                "climate.set_hvac_mode",
                json!({"entity_id": "climate.tank", "hvac_mode": "auto"}),
            ),
            (
                command("climate.tank", DeviceAction::Deactivate),
                "climate.set_hvac_mode",
                json!({"entity_id": "climate.tank", "hvac_mode": "off"}),
            ),
            (
                command("script.warm_up", DeviceAction::SetPercent(30.0)),
                "script.turn_on",
                json!({"entity_id": "script.warm_up"}),
            ),
            (
                DeviceCommand::select_mode("select.boiler_mode", RelayMode::Proportional),
                "select.select_option",
                json!({"entity_id": "select.boiler_mode", "option": "proportional"}),
            ),
        ];

        for (command, service, data) in cases {
            let (actual_service, actual_data) =
                HomeAssistantEntityController::service_call(&command).unwrap();
            assert_eq!(actual_service, service, "{command}");
            assert_eq!(actual_data, data, "{command}");
        }
    }

    #[test]
    fn test_command_without_domain_is_rejected() {
        let command = DeviceCommand {
            entity_id: "fan.attic".to_owned(),
            domain: None,
            hvac_mode: None,
            action: DeviceAction::Activate,
        };
        assert!(HomeAssistantEntityController::service_call(&command).is_err());
    }

    #[tokio::test]
    async fn test_execute_light_percent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/light/turn_on")
            .match_header("authorization", "Bearer test_token")
            .match_body(Matcher::Json(json!({"entity_id": "light.boiler", "brightness": 127})))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = Arc::new(HomeAssistantClient::new(server.url(), "test_token").unwrap());
        let controller = HomeAssistantEntityController::new(client);
        controller
            .execute(&command("light.boiler", DeviceAction::SetPercent(50.0)))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_available_maps_missing_and_unavailable() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/states/switch.missing")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/api/states/switch.offline")
            .with_status(200)
            .with_body(json!({"entity_id": "switch.offline", "state": "unavailable"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/api/states/switch.boiler")
            .with_status(200)
            .with_body(json!({"entity_id": "switch.boiler", "state": "on"}).to_string())
            .create_async()
            .await;

        let client = Arc::new(HomeAssistantClient::new(server.url(), "test_token").unwrap());
        let controller = HomeAssistantEntityController::new(client);

        assert!(controller.read_state("switch.missing").await.is_err());
        assert!(controller.read_available("switch.missing").await.is_none());
        assert!(controller.read_available("switch.offline").await.is_none());
        assert!(controller.read_available("switch.boiler").await.unwrap().is_on());
    }
}
