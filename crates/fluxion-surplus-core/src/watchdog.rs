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

//! Staleness watchdog.
//!
//! When no valid excess observation arrives for longer than the configured
//! interval every device of the entry is switched off, once. A fresh
//! observation re-arms the watchdog.

use chrono::{DateTime, TimeDelta, Utc};
use fluxion_surplus_types::{
    CommandTarget, DeviceAction, DeviceCommand, DeviceConfig, EntityDomain, TargetError,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::traits::EntityController;

/// Pure staleness check
///
/// Returns `(should_force_off, new_alerted)`.
pub fn check_staleness(
    last_seen: Option<DateTime<Utc>>,
    alerted: bool,
    now: DateTime<Utc>,
    stale_after: TimeDelta,
) -> (bool, bool) {
    let Some(last_seen) = last_seen else {
        return (false, alerted);
    };

    if now - last_seen > stale_after {
        (!alerted, true)
    } else {
        (false, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Nothing observed yet
    Idle,
    Fresh,
    /// Fresh again after an alert
    Recovered,
    /// Stale and not yet alerted; devices must be switched off
    ForceOff { silent_for: TimeDelta },
    AlreadyAlerted,
}

#[derive(Debug, Clone)]
pub struct StalenessWatchdog {
    last_seen: Option<DateTime<Utc>>,
    alerted: bool,
    stale_after: TimeDelta,
}

impl StalenessWatchdog {
    pub fn new(stale_after: TimeDelta) -> Self {
        Self {
            last_seen: None,
            alerted: false,
            stale_after,
        }
    }

    pub fn from_secs(stale_after_secs: u64) -> Self {
        let stale_after = i64::try_from(stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self::new(stale_after)
    }

    /// Record a valid observation
    pub fn observe(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
    }

    pub fn check(&mut self, now: DateTime<Utc>) -> WatchdogVerdict {
        let Some(last_seen) = self.last_seen else {
            return WatchdogVerdict::Idle;
        };

        let was_alerted = self.alerted;
        let (force_off, alerted) = check_staleness(self.last_seen, self.alerted, now, self.stale_after);
        self.alerted = alerted;

        match (force_off, was_alerted, alerted) {
            (true, _, _) => WatchdogVerdict::ForceOff {
                silent_for: now - last_seen,
            },
            (false, true, true) => WatchdogVerdict::AlreadyAlerted,
            (false, true, false) => {
                info!("✅ [WATCHDOG] Data fresh again; normal operation resumed");
                WatchdogVerdict::Recovered
            }
            (false, false, _) => WatchdogVerdict::Fresh,
        }
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }
}

/// Outcome of a fail-safe shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub attempted: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Switch off every configured device, continuing past failures
///
/// Targets in domains we cannot command are switched off through the light
/// domain.
pub async fn force_all_off(
    devices: &[DeviceConfig],
    controller: &dyn EntityController,
    reason: &str,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for device in devices {
        let command = match device.command_target() {
            Ok(target) => DeviceCommand::for_target(&target, DeviceAction::Deactivate),
            Err(TargetError::UnsupportedDomain(_)) => {
                let entity_id = device
                    .entity
                    .as_deref()
                    .and_then(|e| e.split('|').next())
                    .unwrap_or_default()
                    .trim()
                    .to_owned();
                DeviceCommand::for_target(
                    &CommandTarget {
                        entity_id,
                        domain: EntityDomain::Light,
                        hvac_mode: None,
                    },
                    DeviceAction::Deactivate,
                )
            }
            Err(TargetError::Missing) => continue,
            Err(e @ TargetError::Malformed(_)) => {
                warn!("⚠️ [WATCHDOG] Skipping '{}': {}", device.name, e);
                report.skipped.push(device.id.clone());
                continue;
            }
        };

        report.attempted.push(command.entity_id.clone());
        if let Err(e) = controller.execute(&command).await {
            warn!("⚠️ [WATCHDOG] OFF failed for {}: {:#}", command.entity_id, e);
            report.failed.push(command.entity_id.clone());
        }
    }

    error!("🛑 [WATCHDOG] Fail-safe OFF enforced ({reason})");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_pure_check() {
        let stale = TimeDelta::minutes(3);
        assert_eq!(check_staleness(None, false, t(1000), stale), (false, false));
        assert_eq!(check_staleness(Some(t(0)), false, t(180), stale), (false, false));
        assert_eq!(check_staleness(Some(t(0)), false, t(181), stale), (true, true));
        assert_eq!(check_staleness(Some(t(0)), true, t(500), stale), (false, true));
        assert_eq!(check_staleness(Some(t(400)), true, t(500), stale), (false, false));
    }

    #[test]
    fn test_forces_off_once_until_fresh_again() {
        let mut watchdog = StalenessWatchdog::from_secs(180);
        assert_eq!(watchdog.check(t(0)), WatchdogVerdict::Idle);

        watchdog.observe(t(0));
        assert_eq!(watchdog.check(t(60)), WatchdogVerdict::Fresh);
        assert_eq!(
            watchdog.check(t(200)),
            WatchdogVerdict::ForceOff {
                silent_for: TimeDelta::seconds(200)
            }
        );
        assert!(watchdog.is_alerted());
        assert_eq!(watchdog.check(t(260)), WatchdogVerdict::AlreadyAlerted);

        watchdog.observe(t(300));
        assert_eq!(watchdog.check(t(310)), WatchdogVerdict::Recovered);
        assert!(!watchdog.is_alerted());
        assert_eq!(watchdog.check(t(320)), WatchdogVerdict::Fresh);

        assert!(matches!(
            watchdog.check(t(600)),
            WatchdogVerdict::ForceOff { .. }
        ));
    }
}
