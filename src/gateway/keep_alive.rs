use log::debug;
use std::time::{Duration, Instant};

use crate::config::settings::KeepAliveConfig;

/// Most recently addressed unit and when it was last talked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveState {
    pub last_active_unit_id: Option<u8>,
    pub last_activity_time: Option<Instant>,
}

/// Decides when an idle bus deserves a liveness probe.
#[derive(Debug, Clone)]
pub struct KeepAlivePoller {
    enabled: bool,
    interval: Duration,
    units: Vec<u8>,
    state: KeepAliveState,
}

impl KeepAlivePoller {
    pub fn new(enabled: bool, interval: Duration, units: Vec<u8>) -> Self {
        Self {
            enabled,
            interval,
            units,
            state: KeepAliveState::default(),
        }
    }

    pub fn from_config(config: &KeepAliveConfig) -> Self {
        Self::new(
            config.enabled,
            config.interval(),
            config.units.clone(),
        )
    }

    pub fn state(&self) -> KeepAliveState {
        self.state
    }

    /// Note a client transaction towards `unit_id`.
    pub fn record_activity(&mut self, unit_id: u8, now: Instant) {
        if !self.units.is_empty() && !self.units.contains(&unit_id) {
            return;
        }
        self.state.last_active_unit_id = Some(unit_id);
        self.state.last_activity_time = Some(now);
    }

    /// Restart the interval after a probe finished, keeping the unit.
    pub fn touch(&mut self, now: Instant) {
        if self.state.last_active_unit_id.is_some() {
            self.state.last_activity_time = Some(now);
        }
    }

    /// Unit to probe, if the interval has run out.
    pub fn due(&self, now: Instant) -> Option<u8> {
        if !self.enabled {
            return None;
        }
        match (self.state.last_active_unit_id, self.state.last_activity_time) {
            (Some(unit_id), Some(last)) if now.duration_since(last) >= self.interval => {
                debug!("💓 Unit {} idle for {:?}, probe due", unit_id, now.duration_since(last));
                Some(unit_id)
            }
            _ => None,
        }
    }
}
