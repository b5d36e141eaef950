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

//! Entity-level control vocabulary shared by the engine and entity controllers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default HVAC mode used when a thermostat target does not name one
pub const DEFAULT_HVAC_MODE: &str = "heat";

/// Entity domains a device can be commanded through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityDomain {
    Light,
    Switch,
    InputBoolean,
    Automation,
    Script,
    Climate,
}

impl EntityDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::InputBoolean => "input_boolean",
            Self::Automation => "automation",
            Self::Script => "script",
            Self::Climate => "climate",
        }
    }

    pub fn all() -> &'static [EntityDomain] {
        &[
            Self::Light,
            Self::Switch,
            Self::InputBoolean,
            Self::Automation,
            Self::Script,
            Self::Climate,
        ]
    }

    /// Domain part of an entity id, if it is one we can command
    pub fn of_entity(entity_id: &str) -> Option<Self> {
        let (domain, _) = entity_id.split_once('.')?;
        Self::all().iter().copied().find(|d| d.as_str() == domain)
    }

    /// Whether the actuator accepts a brightness percent
    pub fn is_dimmable(&self) -> bool {
        matches!(self, Self::Light)
    }
}

impl fmt::Display for EntityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("no command target configured")]
    Missing,

    #[error("malformed entity id: '{0}'")]
    Malformed(String),

    #[error("unsupported entity domain: '{0}'")]
    UnsupportedDomain(String),
}

/// Resolved command target of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTarget {
    pub entity_id: String,
    pub domain: EntityDomain,
    /// HVAC mode used to switch a climate entity on
    pub hvac_mode: Option<String>,
}

impl CommandTarget {
    pub fn hvac_on_mode(&self) -> &str {
        self.hvac_mode.as_deref().unwrap_or(DEFAULT_HVAC_MODE)
    }
}

impl FromStr for CommandTarget {
    type Err = TargetError;

    /// Accepts "domain.object_id" with an optional "|hvac_mode" suffix
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (entity, hvac_mode) = match s.split_once('|') {
            Some((entity, mode)) => {
                let mode = mode.trim();
                (entity.trim(), (!mode.is_empty()).then(|| mode.to_owned()))
            }
            None => (s.trim(), None),
        };

        if entity.is_empty() {
            return Err(TargetError::Missing);
        }

        let Some((domain, object_id)) = entity.split_once('.') else {
            return Err(TargetError::Malformed(entity.to_owned()));
        };
        if domain.is_empty() || object_id.is_empty() {
            return Err(TargetError::Malformed(entity.to_owned()));
        }

        let domain = EntityDomain::of_entity(entity)
            .ok_or_else(|| TargetError::UnsupportedDomain(domain.to_owned()))?;

        Ok(Self {
            entity_id: entity.to_owned(),
            domain,
            hvac_mode,
        })
    }
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hvac_mode {
            Some(mode) => write!(f, "{}|{}", self.entity_id, mode),
            None => f.write_str(&self.entity_id),
        }
    }
}

/// Operating mode selected on a proportional relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Off,
    On,
    Proportional,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Proportional => "proportional",
        }
    }

    pub fn all() -> &'static [RelayMode] {
        &[Self::Off, Self::On, Self::Proportional]
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            "proportional" => Ok(Self::Proportional),
            _ => Err(anyhow::anyhow!(
                "Unknown relay mode: '{}'. Supported modes: off, on, proportional",
                s
            )),
        }
    }
}

/// Action requested from the entity controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceAction {
    Activate,
    Deactivate,
    /// Power level 0-100; 0 switches the target off
    SetPercent(f64),
    /// Select an option on a select entity
    SelectOption(String),
}

/// A single command for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub entity_id: String,
    /// Domain of the target; `None` for select entities
    pub domain: Option<EntityDomain>,
    pub hvac_mode: Option<String>,
    pub action: DeviceAction,
}

impl DeviceCommand {
    pub fn for_target(target: &CommandTarget, action: DeviceAction) -> Self {
        Self {
            entity_id: target.entity_id.clone(),
            domain: Some(target.domain),
            hvac_mode: target.hvac_mode.clone(),
            action,
        }
    }

    pub fn select_mode(entity_id: impl Into<String>, mode: RelayMode) -> Self {
        Self {
            entity_id: entity_id.into(),
            domain: None,
            hvac_mode: None,
            action: DeviceAction::SelectOption(mode.as_str().to_owned()),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            DeviceAction::Activate => write!(f, "{} -> on", self.entity_id),
            DeviceAction::Deactivate => write!(f, "{} -> off", self.entity_id),
            DeviceAction::SetPercent(pct) => write!(f, "{} -> {pct:.0}%", self.entity_id),
            DeviceAction::SelectOption(option) => write!(f, "{} -> '{option}'", self.entity_id),
        }
    }
}

/// Observed state of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        let state = self.state.trim();
        !(state.is_empty()
            || state.eq_ignore_ascii_case("unknown")
            || state.eq_ignore_ascii_case("unavailable"))
    }

    /// Whether the entity currently reports an active state
    pub fn is_on(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        match EntityDomain::of_entity(&self.entity_id) {
            Some(EntityDomain::Climate) => !self.state.eq_ignore_ascii_case("off"),
            _ => self.state.eq_ignore_ascii_case("on"),
        }
    }

    /// Numeric value of a sensor state
    pub fn as_f64(&self) -> Option<f64> {
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn as_relay_mode(&self) -> Option<RelayMode> {
        self.state.parse().ok()
    }
}
