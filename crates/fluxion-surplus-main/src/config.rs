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

mod validation;

pub use validation::{ValidationIssue, ValidationResult};

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use fluxion_surplus_types::{
    CommandTarget, DeviceKind, EntityDomain, EntryConfig, TargetError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

const ADDON_OPTIONS_PATH: &str = "/data/options.json";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub system: SystemConfig,

    /// Independently evaluated PV arrays with their devices
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Home Assistant base URL (optional, defaults to supervisor or localhost)
    #[serde(default)]
    pub ha_base_url: Option<String>,

    /// Home Assistant token (optional, uses SUPERVISOR_TOKEN if not set)
    #[serde(default)]
    pub ha_token: Option<String>,

    /// IANA timezone for device schedules; fetched from HA when not set
    #[serde(default)]
    pub timezone: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Port of the status API
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Directory for runtime-learned device values
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_web_port() -> u16 {
    8099
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/data/surplus")
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            ha_base_url: None,
            ha_token: None,
            timezone: None,
            log_level: default_log_level(),
            web_port: default_web_port(),
            state_dir: default_state_dir(),
        }
    }
}

/// Where the configuration was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    AddonOptions,
    File(PathBuf),
    Environment,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddonOptions => write!(f, "HA addon options ({ADDON_OPTIONS_PATH})"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Environment => f.write_str("defaults with environment overrides"),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or search addon options, config.toml, config.json, then the environment
    ///
    /// The result is not validated; see [`AppConfig::validate_detailed`].
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        if let Some(path) = path {
            let config = Self::read_file(path)?;
            return Ok((config, ConfigSource::File(path.to_path_buf())));
        }

        let addon_options = Path::new(ADDON_OPTIONS_PATH);
        if addon_options.exists() {
            return Ok((Self::read_file(addon_options)?, ConfigSource::AddonOptions));
        }

        for candidate in ["config.toml", "config.json"] {
            let candidate = Path::new(candidate);
            if candidate.exists() {
                let config = Self::read_file(candidate)?;
                return Ok((config, ConfigSource::File(candidate.to_path_buf())));
            }
        }

        Ok((Self::from_env(), ConfigSource::Environment))
    }

    /// Parse a TOML or JSON file, picked by extension
    pub fn read_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let mut config: Self = if is_toml {
            toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment variable overrides (development/testing)
    fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HA_BASE_URL") {
            self.system.ha_base_url = Some(url);
        }
        if let Ok(token) = std::env::var("HA_TOKEN") {
            self.system.ha_token = Some(token);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.system.log_level = level;
        }
        if let Ok(port) = std::env::var("WEB_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.system.web_port = port,
                Err(_) => warn!("Ignoring invalid WEB_PORT '{}'", port),
            }
        }
    }

    /// Configured schedule timezone, if any
    pub fn timezone(&self) -> Result<Option<Tz>> {
        match self.system.timezone.as_deref() {
            Some(name) => match name.parse::<Tz>() {
                Ok(tz) => Ok(Some(tz)),
                Err(e) => bail!("Invalid timezone '{name}': {e}"),
            },
            None => Ok(None),
        }
    }

    /// Validate configuration with detailed error reporting
    pub fn validate_detailed(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        if self.system.timezone.is_some()
            && let Err(e) = self.timezone()
        {
            result.add_error("system.timezone", e.to_string());
        }
        if !LOG_LEVELS.contains(&self.system.log_level.to_lowercase().as_str()) {
            result.add_warning(
                "system.log_level",
                format!(
                    "Unknown log level '{}', expected one of: {}",
                    self.system.log_level,
                    LOG_LEVELS.join(", ")
                ),
            );
        }
        if self.system.web_port == 0 {
            result.add_error("system.web_port", "Must be a valid TCP port");
        }

        if self.entries.is_empty() {
            result.add_error("entries", "Configuration must include at least one entry");
            return result;
        }

        let mut entry_ids = HashSet::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            let prefix = format!("entries[{idx}]");
            if entry.id.trim().is_empty() {
                result.add_error(format!("{prefix}.id"), "Entry ID cannot be empty");
            } else if !entry_ids.insert(entry.id.as_str()) {
                result.add_error(format!("{prefix}.id"), format!("Duplicate entry ID '{}'", entry.id));
            }
            validate_entry(entry, &prefix, &mut result);
        }

        result
    }

    /// Validate, logging warnings and failing on the first report with errors
    pub fn validate(&self) -> Result<()> {
        let result = self.validate_detailed();
        for warning in &result.warnings {
            warn!("⚠️ Config {}: {}", warning.field, warning.message);
        }
        if !result.valid {
            bail!(
                "Configuration has {} error(s):\n{}",
                result.errors.len(),
                result.error_summary()
            );
        }
        Ok(())
    }
}

fn validate_entry(entry: &EntryConfig, prefix: &str, result: &mut ValidationResult) {
    if entry.sensors.pv_power.trim().is_empty() {
        result.add_error(format!("{prefix}.sensors.pv_power"), "PV power sensor is required");
    }
    if entry.sensors.consumption.is_none() && entry.sensors.pv_voltage.is_none() {
        result.add_warning(
            format!("{prefix}.sensors.pv_voltage"),
            "Without a consumption or PV voltage sensor no excess can be estimated",
        );
    }

    let panel = &entry.panel;
    if panel.vmp <= 0.0 {
        result.add_error(format!("{prefix}.panel.vmp"), "Must be positive");
    }
    if panel.imp <= 0.0 {
        result.add_error(format!("{prefix}.panel.imp"), "Must be positive");
    }
    if panel.panel_count == 0 {
        result.add_error(format!("{prefix}.panel.panel_count"), "Must be at least 1");
    }
    if let Some(voc) = panel.voc
        && voc <= panel.vmp
    {
        result.add_warning(
            format!("{prefix}.panel.voc"),
            format!("Voc ({voc}V) should be above Vmp ({}V)", panel.vmp),
        );
    }
    if panel.min_inverter_voltage < 0.0 {
        result.add_error(format!("{prefix}.panel.min_inverter_voltage"), "Must be non-negative");
    }
    if panel.curve_factor_k <= 0.0 {
        result.add_error(format!("{prefix}.panel.curve_factor_k"), "Must be positive");
    }
    if panel.efficiency_correction_factor <= 0.0 {
        result.add_error(
            format!("{prefix}.panel.efficiency_correction_factor"),
            "Must be positive",
        );
    }

    if entry.temperature.enabled && entry.temperature.sensor.is_none() {
        result.add_error(
            format!("{prefix}.temperature.sensor"),
            "Temperature compensation is enabled but no sensor is configured",
        );
    }

    let policy = &entry.policy;
    if policy.reserve_battery_power_w < 0.0 {
        result.add_error(format!("{prefix}.policy.reserve_battery_power_w"), "Must be non-negative");
    }
    result.check_range(
        format!("{prefix}.policy.inverter_self_consumption_w"),
        policy.inverter_self_consumption_w,
        0.0,
        500.0,
    );
    result.check_range(format!("{prefix}.policy.hysteresis_w"), policy.hysteresis_w, 0.0, 5000.0);

    let ramp = &entry.ramp;
    result.check_positive_max(format!("{prefix}.ramp.up_step_pct"), ramp.up_step_pct, 100.0);
    result.check_positive_max(format!("{prefix}.ramp.down_step_pct"), ramp.down_step_pct, 100.0);
    result.check_range(format!("{prefix}.ramp.deadband_pct"), ramp.deadband_pct, 0.0, 10.0);
    if ramp.interval_secs == 0 {
        result.add_error(format!("{prefix}.ramp.interval_secs"), "Must be at least 1 second");
    }

    if entry.poll_interval_secs == 0 {
        result.add_error(format!("{prefix}.poll_interval_secs"), "Must be at least 1 second");
    }
    if entry.watchdog.stale_after_secs == 0 {
        result.add_error(format!("{prefix}.watchdog.stale_after_secs"), "Must be at least 1 second");
    }
    if entry.watchdog.period_secs == 0 {
        result.add_error(format!("{prefix}.watchdog.period_secs"), "Must be at least 1 second");
    }
    if entry.poll_interval_secs >= entry.watchdog.stale_after_secs {
        result.add_warning(
            format!("{prefix}.poll_interval_secs"),
            format!(
                "Polling every {}s with a {}s staleness limit will trip the watchdog",
                entry.poll_interval_secs, entry.watchdog.stale_after_secs
            ),
        );
    }

    let mut device_ids = HashSet::new();
    for (idx, device) in entry.devices.iter().enumerate() {
        let field = format!("{prefix}.devices[{idx}]");

        if device.id.trim().is_empty() {
            result.add_error(format!("{field}.id"), "Device ID cannot be empty");
        } else if !device_ids.insert(device.id.as_str()) {
            result.add_error(format!("{field}.id"), format!("Duplicate device ID '{}'", device.id));
        }

        match device.command_target() {
            Ok(CommandTarget { domain, .. })
                if device.kind == DeviceKind::Thermostat && domain != EntityDomain::Climate =>
            {
                result.add_error(
                    format!("{field}.entity"),
                    "Thermostat devices need a climate entity",
                );
            }
            Ok(_) => {}
            Err(TargetError::Missing) => {
                if device.auto_control {
                    result.add_warning(
                        format!("{field}.entity"),
                        "No entity configured; the device will never be switched",
                    );
                }
            }
            Err(e @ (TargetError::Malformed(_) | TargetError::UnsupportedDomain(_))) => {
                result.add_error(format!("{field}.entity"), e.to_string());
            }
        }

        if device.min_expected_w < 0.0 {
            result.add_error(format!("{field}.min_expected_w"), "Must be non-negative");
        }
        if let Some(max) = device.max_expected_w
            && max < 0.0
        {
            result.add_error(format!("{field}.max_expected_w"), "Must be non-negative");
        }

        if device.kind == DeviceKind::Proportional {
            if device.mode_select_entity.is_none() {
                result.add_warning(
                    format!("{field}.mode_select_entity"),
                    "Proportional devices are only driven when a relay mode select is configured",
                );
            }
            if device.max_expected_w.is_none_or(|max| max <= device.min_expected_w) {
                result.add_warning(
                    format!("{field}.max_expected_w"),
                    "Not above min_expected_w; percent control assumes 110% of the minimum",
                );
            }
        }

        if let Some(schedule) = &device.schedule
            && schedule.enabled
            && (schedule.start.is_none() || schedule.end.is_none())
        {
            result.add_warning(
                format!("{field}.schedule"),
                "Schedule is enabled without start and end; it will not restrict the device",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_TOML: &str = r#"
[system]
timezone = "Europe/Prague"
state_dir = "/tmp/surplus"

[[entries]]
id = "roof"
poll_interval_secs = 10

[entries.sensors]
pv_power = "sensor.pv_power"
pv_voltage = "sensor.pv_voltage"
battery_power = "sensor.battery_power"

[entries.panel]
vmp = 44.0
imp = 10.0
panel_count = 10
topology = "series"

[entries.policy]
reserve_battery_power_w = 500
strategy = "distribute-evenly"

[[entries.devices]]
id = "boiler"
name = "Boiler"
entity = "light.boiler"
mode_select_entity = "select.boiler_mode"
kind = "proportional"
priority = 80
min_expected_w = 100
max_expected_w = 2000
auto_control = true

[[entries.devices]]
id = "pool"
name = "Pool pump"
entity = "switch.pool"
min_expected_w = 300
auto_control = true
"#;

    fn minimal() -> AppConfig {
        toml::from_str(MINIMAL_TOML).unwrap()
    }

    #[test]
    fn test_minimal_toml_is_valid() {
        let config = minimal();
        assert_eq!(config.system.web_port, 8099);
        assert_eq!(config.system.log_level, "info");
        assert_eq!(config.entries.len(), 1);
        assert_eq!(config.entries[0].devices.len(), 2);
        assert_eq!(config.timezone().unwrap(), Some(chrono_tz::Europe::Prague));

        let result = config.validate_detailed();
        assert!(result.valid, "{}", result.error_summary());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_entries_is_an_error() {
        let config = AppConfig::default();
        let result = config.validate_detailed();
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "entries");
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("at least one entry")
        );
    }

    #[test]
    fn test_ranges_are_enforced() {
        let mut config = minimal();
        let entry = &mut config.entries[0];
        entry.policy.inverter_self_consumption_w = 600.0;
        entry.policy.hysteresis_w = -1.0;
        entry.ramp.up_step_pct = 0.0;
        entry.ramp.down_step_pct = 120.0;
        entry.ramp.deadband_pct = 12.0;
        entry.panel.min_inverter_voltage = -5.0;

        let result = config.validate_detailed();
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "entries[0].panel.min_inverter_voltage",
                "entries[0].policy.inverter_self_consumption_w",
                "entries[0].policy.hysteresis_w",
                "entries[0].ramp.up_step_pct",
                "entries[0].ramp.down_step_pct",
                "entries[0].ramp.deadband_pct",
            ]
        );
    }

    #[test]
    fn test_duplicate_ids_and_bad_targets() {
        let mut config = minimal();
        let entry = &mut config.entries[0];
        entry.devices[1].id = "boiler".to_owned();
        entry.devices[1].entity = Some("fan.attic".to_owned());
        let mut tank = entry.devices[0].clone();
        tank.id = "tank".to_owned();
        tank.kind = DeviceKind::Thermostat;
        entry.devices.push(tank);
        let copy = config.entries[0].clone();
        config.entries.push(copy);

        let result = config.validate_detailed();
        let messages: Vec<String> = result
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();

        assert!(messages.iter().any(|m| m.contains("Duplicate device ID 'boiler'")));
        assert!(messages.iter().any(|m| m.contains("devices[1].entity")));
        assert!(messages.iter().any(|m| m.contains("climate entity")));
        assert!(messages.iter().any(|m| m.contains("Duplicate entry ID 'roof'")));
    }

    #[test]
    fn test_invalid_timezone() {
        let mut config = minimal();
        config.system.timezone = Some("Mars/Olympus".to_owned());
        assert!(config.timezone().is_err());
        assert!(!config.validate_detailed().valid);
    }

    #[test]
    fn test_warnings_for_risky_settings() {
        let mut config = minimal();
        let entry = &mut config.entries[0];
        entry.poll_interval_secs = 300;
        entry.devices[0].mode_select_entity = None;

        let result = config.validate_detailed();
        assert!(result.valid, "{}", result.error_summary());
        let fields: Vec<&str> = result.warnings.iter().map(|w| w.field.as_str()).collect();
        assert!(fields.contains(&"entries[0].poll_interval_secs"));
        assert!(fields.contains(&"entries[0].devices[0].mode_select_entity"));
    }

    #[test]
    fn test_read_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("surplus.toml");
        std::fs::File::create(&toml_path)
            .unwrap()
            .write_all(MINIMAL_TOML.as_bytes())
            .unwrap();
        let from_toml = AppConfig::read_file(&toml_path).unwrap();
        assert_eq!(from_toml.entries[0].id, "roof");

        let json_path = dir.path().join("options.json");
        std::fs::write(&json_path, serde_json::to_string(&from_toml).unwrap()).unwrap();
        let (from_json, source) = AppConfig::load(Some(&json_path)).unwrap();
        assert_eq!(source, ConfigSource::File(json_path.clone()));
        assert_eq!(from_json.entries, from_toml.entries);

        std::fs::write(&json_path, "{ broken").unwrap();
        assert!(AppConfig::read_file(&json_path).is_err());
    }
}
