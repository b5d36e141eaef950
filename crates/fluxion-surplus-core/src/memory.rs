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

//! Persistence of runtime-learned device values.
//!
//! What a device was last doing (relay mode, percent, on/off) is written to
//! disk so it can be restored after a restart.

use anyhow::{Context, Result};
use fluxion_surplus_types::{AllocationResult, RelayMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Values remembered for one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RememberedDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mode: Option<RelayMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_on: Option<bool>,
}

/// Remembered values of all devices of one entry, keyed by device id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    #[serde(default)]
    pub devices: BTreeMap<String, RememberedDevice>,
}

impl DeviceMemory {
    pub fn device(&self, device_id: &str) -> Option<&RememberedDevice> {
        self.devices.get(device_id)
    }

    /// Returns true when the stored mode changed
    pub fn remember_mode(&mut self, device_id: &str, mode: RelayMode) -> bool {
        let entry = self.devices.entry(device_id.to_owned()).or_default();
        if entry.last_mode == Some(mode) {
            return false;
        }
        entry.last_mode = Some(mode);
        true
    }

    /// Record the on/off state and percent of every evaluated device
    ///
    /// Returns true when anything changed.
    pub fn remember_result(&mut self, result: &AllocationResult) -> bool {
        let mut changed = false;

        for (device_id, status) in &result.devices {
            if status.entity_id.is_none() {
                continue;
            }
            let entry = self.devices.entry(device_id.clone()).or_default();

            if entry.restore_on != Some(status.is_on) {
                entry.restore_on = Some(status.is_on);
                changed = true;
            }

            let percent = if status.is_on && status.mode == Some(RelayMode::Proportional) {
                let percent = if status.percent_actual > 0.0 {
                    status.percent_actual
                } else {
                    status.percent_target
                };
                Some(percent.round())
            } else {
                None
            };
            if entry.last_percent != percent {
                entry.last_percent = percent;
                changed = true;
            }
        }

        changed
    }
}

/// JSON file store for [`DeviceMemory`]
#[derive(Debug, Clone)]
pub struct DeviceMemoryStore {
    path: PathBuf,
}

impl DeviceMemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store of one entry inside a state directory
    pub fn for_entry(state_dir: impl AsRef<Path>, entry_id: &str) -> Self {
        Self::new(state_dir.as_ref().join(format!("{entry_id}_devices.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load remembered values; a missing file yields an empty memory
    pub fn load(&self) -> Result<DeviceMemory> {
        if !self.path.exists() {
            info!(
                "Device memory not found at {}, starting empty",
                self.path.display()
            );
            return Ok(DeviceMemory::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read device memory from {}", self.path.display()))?;

        let memory: DeviceMemory = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse device memory from {}", self.path.display()))?;

        info!(
            "Loaded device memory for {} devices from {}",
            memory.devices.len(),
            self.path.display()
        );

        Ok(memory)
    }

    /// Write through a temp file and rename
    pub fn save(&self, memory: &DeviceMemory) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(memory).context("Failed to serialize device memory")?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .with_context(|| format!("Failed to write temp file {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename temp file to {}", self.path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fluxion_surplus_types::{DeviceConfig, DeviceStatus};
    use tempfile::tempdir;

    fn status(is_on: bool, mode: Option<RelayMode>, percent: f64) -> DeviceStatus {
        let mut device = DeviceConfig::new("boiler", "Boiler");
        device.entity = Some("light.boiler".to_owned());
        let mut status = DeviceStatus::for_device(&device);
        status.is_on = is_on;
        status.mode = mode;
        status.percent_target = percent;
        status
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = DeviceMemoryStore::new(dir.path().join("missing.json"));
        assert!(!store.exists());
        assert!(store.load().unwrap().devices.is_empty());
    }

    #[test]
    fn test_save_creates_directory_and_round_trips() {
        let dir = tempdir().unwrap();
        let store = DeviceMemoryStore::for_entry(dir.path().join("state"), "roof");

        let mut memory = DeviceMemory::default();
        assert!(memory.remember_mode("boiler", RelayMode::Proportional));
        assert!(!memory.remember_mode("boiler", RelayMode::Proportional));

        store.save(&memory).unwrap();
        assert!(store.exists());
        assert!(!store.path().with_extension("tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, memory);
        assert_eq!(
            loaded.device("boiler").and_then(|d| d.last_mode),
            Some(RelayMode::Proportional)
        );
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roof_devices.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(DeviceMemoryStore::new(path).load().is_err());
    }

    #[test]
    fn test_remember_result_tracks_changes() {
        let mut result = AllocationResult::empty(500.0, Utc::now());
        result.devices.insert(
            "boiler".to_owned(),
            status(true, Some(RelayMode::Proportional), 42.4),
        );

        let mut memory = DeviceMemory::default();
        assert!(memory.remember_result(&result));
        let remembered = memory.device("boiler").unwrap();
        assert_eq!(remembered.restore_on, Some(true));
        assert_eq!(remembered.last_percent, Some(42.0));

        assert!(!memory.remember_result(&result));

        result
            .devices
            .insert("boiler".to_owned(), status(false, Some(RelayMode::Proportional), 0.0));
        assert!(memory.remember_result(&result));
        let remembered = memory.device("boiler").unwrap();
        assert_eq!(remembered.restore_on, Some(false));
        assert_eq!(remembered.last_percent, None);
    }
}
