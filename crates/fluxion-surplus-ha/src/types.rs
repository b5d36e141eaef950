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

use fluxion_surplus_types::EntityState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity state as returned by `/api/states/{entity_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaEntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl HaEntityState {
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

impl From<HaEntityState> for EntityState {
    fn from(state: HaEntityState) -> Self {
        EntityState::new(state.entity_id, state.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_minimal_state() {
        let state: HaEntityState = serde_json::from_value(json!({
            "entity_id": "select.boiler_mode",
            "state": "proportional",
            "attributes": {"options": ["off", "on", "proportional"], "friendly_name": "Boiler mode"}
        }))
        .unwrap();

        assert_eq!(state.attribute_str("friendly_name"), Some("Boiler mode"));
        assert!(state.last_updated.is_none());

        let entity: EntityState = state.into();
        assert_eq!(entity.as_relay_mode(), Some(fluxion_surplus_types::RelayMode::Proportional));
    }
}
