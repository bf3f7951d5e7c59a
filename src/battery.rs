//! Forced battery discharge around a scenario.
//!
//! Power measurements are only meaningful while the device runs from its
//! battery. [`BatteryGuard::engage`] switches the charger off and hands out a
//! [`Discharge`] handle; normal charging is restored when the handle is
//! released or dropped, whichever comes first.

use std::{
    fmt,
    io::ErrorKind as IoErrorKind,
    path::PathBuf,
    process::Command,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CollaboratorError, Error},
    registry::{self, Reservation},
};

/// Battery level below which forced discharge is refused.
pub const DEFAULT_DISCHARGE_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryMode {
    ForceDischarge,
    #[default]
    NoDischarge,
}

impl FromStr for BatteryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ForceDischarge" => Ok(BatteryMode::ForceDischarge),
            "NoDischarge" => Ok(BatteryMode::NoDischarge),
            other => Err(Error::config(format!("unknown battery mode {other:?}"))),
        }
    }
}

impl fmt::Display for BatteryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryMode::ForceDischarge => f.write_str("ForceDischarge"),
            BatteryMode::NoDischarge => f.write_str("NoDischarge"),
        }
    }
}

/// Access to the device's charger.
pub trait PowerSupply: Send + Sync {
    /// Current charge in percent, `None` on devices without a battery.
    fn battery_percent(&self) -> Result<Option<f64>, CollaboratorError>;

    fn set_discharge(&self, discharge: bool) -> Result<(), CollaboratorError>;
}

/// [`PowerSupply`] backed by sysfs and the embedded-controller tool.
#[derive(Debug, Clone)]
pub struct SysfsPowerSupply {
    capacity: PathBuf,
    ectool: PathBuf,
}

impl Default for SysfsPowerSupply {
    fn default() -> Self {
        Self {
            capacity: PathBuf::from("/sys/class/power_supply/BAT0/capacity"),
            ectool: PathBuf::from("ectool"),
        }
    }
}

impl SysfsPowerSupply {
    pub fn new(capacity: impl Into<PathBuf>, ectool: impl Into<PathBuf>) -> Self {
        Self {
            capacity: capacity.into(),
            ectool: ectool.into(),
        }
    }
}

impl PowerSupply for SysfsPowerSupply {
    fn battery_percent(&self) -> Result<Option<f64>, CollaboratorError> {
        let text = match std::fs::read_to_string(&self.capacity) {
            Ok(text) => text,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        text.trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| CollaboratorError::failed("battery capacity", e))
    }

    fn set_discharge(&self, discharge: bool) -> Result<(), CollaboratorError> {
        let mode = if discharge { "discharge" } else { "normal" };
        let status = Command::new(&self.ectool)
            .args(["chargecontrol", mode])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::failed(
                "charge control",
                format!("ectool chargecontrol {mode} exited with {status}"),
            ))
        }
    }
}

#[derive(Clone)]
pub struct BatteryGuard {
    supply: Arc<dyn PowerSupply>,
    threshold: f64,
}

impl BatteryGuard {
    pub fn new(supply: Arc<dyn PowerSupply>, threshold: f64) -> Self {
        Self { supply, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Switch to battery power.
    ///
    /// On a device without a battery this logs once and returns an inactive
    /// handle. Fails with [`CollaboratorError::BatteryTooLow`] below the
    /// threshold and with [`CollaboratorError::AlreadyDischarging`] while
    /// another guard is engaged.
    pub fn engage(&self) -> Result<Discharge, CollaboratorError> {
        let Some(level) = self.supply.battery_percent()? else {
            tracing::info!("no battery present, forced discharge skipped");
            return Ok(Discharge::inactive());
        };
        if level < self.threshold {
            return Err(CollaboratorError::BatteryTooLow {
                level,
                threshold: self.threshold,
            });
        }
        let slot = registry::reserve_battery_discharge()?;
        self.supply.set_discharge(true)?;
        tracing::info!(level, threshold = self.threshold, "forced battery discharge engaged");
        Ok(Discharge {
            supply: Some(Arc::clone(&self.supply)),
            _slot: Some(slot),
        })
    }
}

impl fmt::Debug for BatteryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatteryGuard")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Release handle of an engaged [`BatteryGuard`].
#[must_use = "charging is restored as soon as the handle is dropped"]
pub struct Discharge {
    supply: Option<Arc<dyn PowerSupply>>,
    _slot: Option<Reservation>,
}

impl Discharge {
    fn inactive() -> Self {
        Self {
            supply: None,
            _slot: None,
        }
    }

    /// Whether the device actually runs from its battery.
    pub fn is_active(&self) -> bool {
        self.supply.is_some()
    }

    /// Restore normal charging, reporting failures.
    pub fn release(mut self) -> Result<(), CollaboratorError> {
        match self.supply.take() {
            Some(supply) => {
                supply.set_discharge(false)?;
                tracing::info!("normal charging restored");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for Discharge {
    fn drop(&mut self) {
        if let Some(supply) = self.supply.take() {
            match supply.set_discharge(false) {
                Ok(()) => tracing::info!("normal charging restored"),
                Err(e) => tracing::warn!(error = %e, "failed to restore normal charging"),
            }
        }
    }
}

impl fmt::Debug for Discharge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discharge")
            .field("active", &self.is_active())
            .finish()
    }
}
