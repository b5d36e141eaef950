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

//! Gradual percent changes for dimmable actuators.

use fluxion_surplus_types::RampConfig;
use std::collections::{BTreeMap, HashMap};

/// Steps dimmable actuators toward their allocation targets
#[derive(Debug, Clone)]
pub struct Ramper {
    config: RampConfig,
    targets: BTreeMap<String, f64>,
    current: HashMap<String, f64>,
}

impl Ramper {
    pub fn new(config: RampConfig) -> Self {
        Self {
            config,
            targets: BTreeMap::new(),
            current: HashMap::new(),
        }
    }

    /// Replace the targets with those of the latest allocation cycle
    ///
    /// Levels of actuators missing from `targets` are kept; they resume from
    /// there once targeted again.
    pub fn set_targets(&mut self, targets: &BTreeMap<String, f64>) {
        self.targets.clone_from(targets);
    }

    /// Forget actuators that are no longer configured
    pub fn retain_entities<'a>(&mut self, entity_ids: impl IntoIterator<Item = &'a str>) {
        let keep: Vec<&str> = entity_ids.into_iter().collect();
        self.current.retain(|entity, _| keep.contains(&entity.as_str()));
        self.targets.retain(|entity, _| keep.contains(&entity.as_str()));
    }

    /// Drop all targets and levels, e.g. after everything was forced off
    pub fn clear(&mut self) {
        self.targets.clear();
        self.current.clear();
    }

    /// Set the current level without emitting a command, e.g. after a restore
    pub fn seed(&mut self, entity_id: &str, percent: f64) {
        self.current.insert(entity_id.to_owned(), percent.clamp(0.0, 100.0));
    }

    pub fn current(&self, entity_id: &str) -> Option<f64> {
        self.current.get(entity_id).copied()
    }

    pub fn target(&self, entity_id: &str) -> Option<f64> {
        self.targets.get(entity_id).copied()
    }

    /// Advance every actuator by one step
    ///
    /// Returns the `(entity_id, percent)` pairs that changed and must be sent.
    pub fn step(&mut self) -> Vec<(String, f64)> {
        let mut changes = Vec::new();

        for (entity_id, &target) in &self.targets {
            let target = target.clamp(0.0, 100.0);
            let current = self.current.get(entity_id).copied().unwrap_or(0.0);
            let delta = target - current;

            if delta.abs() < self.config.deadband_pct {
                continue;
            }
            if delta.abs() < f64::EPSILON {
                continue;
            }

            let next = if delta > 0.0 {
                (current + self.config.up_step_pct).min(target)
            } else {
                (current - self.config.down_step_pct).max(target)
            };

            self.current.insert(entity_id.clone(), next);
            changes.push((entity_id.clone(), next));
        }

        changes
    }
}
