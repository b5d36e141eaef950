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

//! Runtime of one configured entry.
//!
//! Every operation that touches devices (allocation, watchdog, ramping, relay
//! services) takes the entry's state lock, so they never interleave.

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use fluxion_surplus_types::{
    AllocationResult, CommandTarget, DeviceAction, DeviceCommand, DeviceConfig, DeviceKind,
    EntityDomain, EntryConfig, RelayMode,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::allocation::AllocationEngine;
use crate::excess::ExcessReport;
use crate::memory::{DeviceMemory, DeviceMemoryStore};
use crate::modes::{ModeObservation, ModeTracker};
use crate::ramp::Ramper;
use crate::telemetry;
use crate::traits::{AllocationObserver, Clock, EntityController};
use crate::watchdog::{self, StalenessWatchdog, WatchdogVerdict};

/// Which devices a relay service call applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget<'a> {
    /// A raw entity id, e.g. "select.boiler_mode" or "light.boiler"
    Entity(&'a str),
    Device(&'a str),
    All,
}

struct EntryState {
    engine: AllocationEngine,
    watchdog: StalenessWatchdog,
    ramper: Ramper,
    modes: ModeTracker,
    memory: DeviceMemory,
}

pub struct SurplusEntry {
    config: Arc<EntryConfig>,
    controller: Arc<dyn EntityController>,
    observer: Arc<dyn AllocationObserver>,
    clock: Arc<dyn Clock>,
    memory_store: Option<DeviceMemoryStore>,
    state: Mutex<EntryState>,
}

impl SurplusEntry {
    pub fn new(
        config: EntryConfig,
        timezone: Tz,
        controller: Arc<dyn EntityController>,
        observer: Arc<dyn AllocationObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = EntryState {
            engine: AllocationEngine::new(timezone),
            watchdog: StalenessWatchdog::from_secs(config.watchdog.stale_after_secs),
            ramper: Ramper::new(config.ramp.clone()),
            modes: ModeTracker::new(),
            memory: DeviceMemory::default(),
        };
        Self {
            config: Arc::new(config),
            controller,
            observer,
            clock,
            memory_store: None,
            state: Mutex::new(state),
        }
    }

    /// Persist learned device values through `store`, loading what it holds
    ///
    /// An unreadable store is logged and replaced on the next save.
    pub fn with_memory_store(mut self, store: DeviceMemoryStore) -> Self {
        match store.load() {
            Ok(memory) => self.state.get_mut().memory = memory,
            Err(e) => warn!(
                "⚠️ Ignoring unreadable device memory of entry '{}': {:#}",
                self.config.id, e
            ),
        }
        self.memory_store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    /// Put devices back the way they were before a restart
    ///
    /// Returns the number of commands sent.
    pub async fn restore_devices(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut sent = 0;

        for device in &self.config.devices {
            let remembered = state.memory.device(&device.id).cloned().unwrap_or_default();

            if device.kind == DeviceKind::Proportional
                && let Some(select) = device.mode_select_entity.as_deref()
            {
                if let Some(mode) = remembered.last_mode {
                    state.modes.set_desired(select, mode);
                }
                let observed = self.controller.read_state(select).await.ok();
                match state.modes.observe(select, observed.as_ref()) {
                    ModeObservation::Reapply(mode) => {
                        info!("Restoring mode '{}' for {}", mode, select);
                        if self.send(DeviceCommand::select_mode(select, mode)).await {
                            sent += 1;
                        }
                    }
                    ModeObservation::Learned(mode) => {
                        state.memory.remember_mode(&device.id, mode);
                    }
                    ModeObservation::Unchanged => {}
                }
            }

            let Ok(target) = device.command_target() else {
                continue;
            };
            let Some(observed) = self.controller.read_available(&target.entity_id).await else {
                debug!("No restore for {}: entity unavailable", target.entity_id);
                continue;
            };

            let mut is_on = observed.is_on();
            if let Some(restore_on) = remembered.restore_on
                && restore_on != is_on
            {
                let action = if restore_on {
                    DeviceAction::Activate
                } else {
                    DeviceAction::Deactivate
                };
                info!(
                    "Restoring {} state for {}",
                    if restore_on { "ON" } else { "OFF" },
                    target
                );
                if self.send(DeviceCommand::for_target(&target, action)).await {
                    sent += 1;
                    is_on = restore_on;
                }
            }

            if is_on && let Some(percent) = remembered.last_percent {
                info!("Restoring percent {} for {}", percent, target);
                if self
                    .send(DeviceCommand::for_target(&target, DeviceAction::SetPercent(percent)))
                    .await
                {
                    sent += 1;
                    if target.domain.is_dimmable() {
                        state.ramper.seed(&target.entity_id, percent);
                    }
                }
            }

            if device.auto_control {
                state.engine.assume_state(&device.id, is_on, now);
            }
        }

        self.save_memory(&state.memory);

        if sent == 0 {
            info!("No device states needed to be restored for entry '{}'", self.id());
        }
        sent
    }

    /// Read telemetry and run one allocation cycle
    ///
    /// Returns `None` when telemetry could not be read.
    pub async fn poll(&self) -> Option<AllocationResult> {
        let report = telemetry::observe_excess(self.controller.as_ref(), &self.config).await?;
        self.observer.publish_excess(self.id(), &report);
        Some(self.on_excess(&report).await)
    }

    /// Run one allocation cycle for an excess observation
    pub async fn on_excess(&self, report: &ExcessReport) -> AllocationResult {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.watchdog.observe(now);

        self.track_modes(&mut state).await;

        state.engine.retain_devices(&self.config.devices);
        let entities: Vec<String> = self
            .config
            .devices
            .iter()
            .filter_map(|d| d.command_target().ok())
            .map(|t| t.entity_id)
            .collect();
        state.ramper.retain_entities(entities.iter().map(String::as_str));
        let mut result = state
            .engine
            .evaluate(
                report.excess_w,
                now,
                &self.config.devices,
                &self.config.policy,
                self.controller.as_ref(),
            )
            .await;

        state.ramper.set_targets(&result.ramp_targets);
        for status in result.devices.values_mut() {
            if let Some(entity) = status.entity_id.as_deref()
                && let Some(level) = state.ramper.current(entity.split('|').next().unwrap_or(entity))
            {
                status.percent_actual = level;
            }
        }

        self.observer.publish_allocation(self.id(), &result);

        if state.memory.remember_result(&result) {
            self.save_memory(&state.memory);
        }

        result
    }

    /// Follow relay mode selects, re-applying modes lost after an outage
    async fn track_modes(&self, state: &mut EntryState) {
        let mut changed = false;
        for device in &self.config.devices {
            let Some(select) = device.mode_select_entity.as_deref() else {
                continue;
            };
            if device.kind != DeviceKind::Proportional {
                continue;
            }
            let observed = self.controller.read_state(select).await.ok();
            match state.modes.observe(select, observed.as_ref()) {
                ModeObservation::Learned(mode) => {
                    changed |= state.memory.remember_mode(&device.id, mode);
                }
                ModeObservation::Reapply(mode) => {
                    self.send(DeviceCommand::select_mode(select, mode)).await;
                }
                ModeObservation::Unchanged => {}
            }
        }
        if changed {
            self.save_memory(&state.memory);
        }
    }

    /// Check input staleness and force devices off when needed
    pub async fn watchdog_tick(&self) -> WatchdogVerdict {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let verdict = state.watchdog.check(now);

        match verdict {
            WatchdogVerdict::ForceOff { silent_for } => {
                let reason = format!("excess input stale for {}s", silent_for.num_seconds());
                let report = watchdog::force_all_off(
                    &self.config.devices,
                    self.controller.as_ref(),
                    &reason,
                )
                .await;
                debug!(
                    "Watchdog shutdown of '{}': {} attempted, {} failed",
                    self.id(),
                    report.attempted.len(),
                    report.failed.len()
                );
                state.engine.mark_all_off(now);
                state.ramper.clear();
                self.observer.publish_watchdog(self.id(), true);
            }
            WatchdogVerdict::Recovered => {
                self.observer.publish_watchdog(self.id(), false);
            }
            WatchdogVerdict::Idle | WatchdogVerdict::Fresh | WatchdogVerdict::AlreadyAlerted => {}
        }

        verdict
    }

    /// Advance ramping actuators by one step; returns the number of commands sent
    pub async fn ramp_tick(&self) -> usize {
        let mut state = self.state.lock().await;
        let changes = state.ramper.step();
        drop(state);

        let mut sent = 0;
        for (entity_id, percent) in changes {
            let command = DeviceCommand {
                domain: EntityDomain::of_entity(&entity_id),
                entity_id,
                hvac_mode: None,
                action: DeviceAction::SetPercent(percent),
            };
            if self.send(command).await {
                sent += 1;
            }
        }
        sent
    }

    /// Select a relay mode on one device, one entity or all devices
    pub async fn set_relay_mode(&self, target: RelayTarget<'_>, mode: RelayMode) -> Result<usize> {
        let mut state = self.state.lock().await;

        let selects: Vec<(Option<&DeviceConfig>, &str)> = match target {
            RelayTarget::Entity(entity_id) => {
                let owner = self
                    .config
                    .devices
                    .iter()
                    .find(|d| d.mode_select_entity.as_deref() == Some(entity_id));
                vec![(owner, entity_id)]
            }
            RelayTarget::Device(device_id) => {
                let device = self
                    .config
                    .device(device_id)
                    .ok_or_else(|| anyhow!("Device with ID {device_id} not found"))?;
                let select = device.mode_select_entity.as_deref().ok_or_else(|| {
                    anyhow!("Device {} has no mode select entity configured", device.name)
                })?;
                vec![(Some(device), select)]
            }
            RelayTarget::All => self
                .config
                .devices
                .iter()
                .filter_map(|d| d.mode_select_entity.as_deref().map(|s| (Some(d), s)))
                .collect(),
        };

        let mut applied = 0;
        let mut changed = false;
        for (device, select) in selects {
            if self.controller.read_available(select).await.is_none() {
                debug!("Entity {select} not found or unavailable, skipping set_relay_mode({mode})");
                continue;
            }
            if !self.send(DeviceCommand::select_mode(select, mode)).await {
                continue;
            }
            applied += 1;
            state.modes.set_desired(select, mode);
            if let Some(device) = device {
                changed |= state.memory.remember_mode(&device.id, mode);
            }
        }

        if changed {
            self.save_memory(&state.memory);
        }
        Ok(applied)
    }

    /// Drive one device, one entity or all devices to a power percent
    pub async fn set_relay_power(&self, target: RelayTarget<'_>, percent: f64) -> Result<usize> {
        let percent = percent.clamp(0.0, 100.0);
        let mut state = self.state.lock().await;

        let targets: Vec<CommandTarget> = match target {
            RelayTarget::Entity(entity_id) => vec![
                entity_id
                    .parse()
                    .with_context(|| format!("Cannot control entity '{entity_id}'"))?,
            ],
            RelayTarget::Device(device_id) => {
                let device = self
                    .config
                    .device(device_id)
                    .ok_or_else(|| anyhow!("Device with ID {device_id} not found"))?;
                vec![device.command_target().with_context(|| {
                    format!("Device {} has no usable entity configured", device.name)
                })?]
            }
            RelayTarget::All => self
                .config
                .devices
                .iter()
                .filter_map(|d| d.command_target().ok())
                .collect(),
        };

        let mut applied = 0;
        for target in targets {
            if self.controller.read_available(&target.entity_id).await.is_none() {
                debug!(
                    "Entity {} not found or unavailable, skipping set_relay_power({percent}%)",
                    target.entity_id
                );
                continue;
            }
            let command = DeviceCommand::for_target(&target, DeviceAction::SetPercent(percent));
            if self.send(command).await {
                applied += 1;
                if target.domain.is_dimmable() {
                    state.ramper.seed(&target.entity_id, percent);
                }
            }
        }
        Ok(applied)
    }

    /// Run the entry until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut poll = interval(secs(self.config.poll_interval_secs));
        let mut watchdog = interval(secs(self.config.watchdog.period_secs));
        let mut ramp = interval(secs(self.config.ramp.interval_secs));
        for timer in [&mut poll, &mut watchdog, &mut ramp] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        self.restore_devices().await;

        // Arm the watchdog so that input that never arrives also fails safe
        self.state.lock().await.watchdog.observe(self.clock.now());

        info!(
            "🚀 Entry '{}' running: {} devices, poll every {}s",
            self.config.display_name(),
            self.config.devices.len(),
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Entry '{}' shutting down", self.id());
                    break;
                }
                _ = poll.tick() => {
                    if self.poll().await.is_none() {
                        debug!("Entry '{}': no valid telemetry this cycle", self.id());
                    }
                }
                _ = watchdog.tick() => {
                    self.watchdog_tick().await;
                }
                _ = ramp.tick() => {
                    self.ramp_tick().await;
                }
            }
        }
    }

    async fn send(&self, command: DeviceCommand) -> bool {
        match self.controller.execute(&command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️ Command {} failed: {:#}", command, e);
                false
            }
        }
    }

    fn save_memory(&self, memory: &DeviceMemory) {
        if let Some(store) = &self.memory_store
            && let Err(e) = store.save(memory)
        {
            warn!("⚠️ Failed to save device memory: {:#}", e);
        }
    }
}

impl fmt::Debug for SurplusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurplusEntry")
            .field("id", &self.config.id)
            .field("devices", &self.config.devices.len())
            .field("controller", &self.controller.name())
            .field("memory_store", &self.memory_store)
            .finish_non_exhaustive()
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}
