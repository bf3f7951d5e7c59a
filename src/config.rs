use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{battery::BatteryMode, error::Error};

/// Device posture a scenario runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CujMode {
    Tablet,
    Clamshell,
}

impl FromStr for CujMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tablet" => Ok(CujMode::Tablet),
            "clamshell" => Ok(CujMode::Clamshell),
            other => Err(Error::config(format!("unknown cuj_mode {other:?}"))),
        }
    }
}

impl fmt::Display for CujMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CujMode::Tablet => f.write_str("tablet"),
            CujMode::Clamshell => f.write_str("clamshell"),
        }
    }
}

/// Parameters the test harness passes to a scenario.
///
/// Only the keys below are recognized; anything else is rejected when the
/// configuration is parsed.
///
/// | key           | effect                                                  |
/// |---------------|---------------------------------------------------------|
/// | `record`      | record the screen while the scenario runs               |
/// | `tracing`     | wrap the scenario in a system trace                     |
/// | `batteryMode` | `ForceDischarge` runs the scenario on battery power     |
/// | `cuj_mode`    | `tablet` or `clamshell` posture for the scenario body   |
/// | `cuj_mute`    | mute audio while the scenario runs                      |
/// | `perf_level`  | workload tier for the scenario body (free-form)         |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub tracing: bool,
    #[serde(default, rename = "batteryMode")]
    pub battery_mode: BatteryMode,
    #[serde(default)]
    pub cuj_mode: Option<CujMode>,
    #[serde(default)]
    pub cuj_mute: bool,
    #[serde(default)]
    pub perf_level: Option<String>,
}

impl ScenarioConfig {
    /// Parse harness key/value parameters.
    pub fn from_params<'a, I>(params: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = ScenarioConfig::default();
        for (key, value) in params {
            match key {
                "record" => config.record = parse_bool(key, value)?,
                "tracing" => config.tracing = parse_bool(key, value)?,
                "batteryMode" => config.battery_mode = value.parse()?,
                "cuj_mode" => config.cuj_mode = Some(value.parse()?),
                "cuj_mute" => config.cuj_mute = parse_bool(key, value)?,
                "perf_level" => config.perf_level = Some(value.to_string()),
                other => return Err(Error::config(format!("unknown scenario parameter {other:?}"))),
            }
        }
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::config(format!("{key} expects a bool, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_parsed() {
        let config = ScenarioConfig::from_params([
            ("record", "true"),
            ("batteryMode", "ForceDischarge"),
            ("cuj_mode", "tablet"),
            ("perf_level", "premium"),
        ])
        .unwrap();
        assert!(config.record);
        assert!(!config.tracing);
        assert_eq!(config.battery_mode, BatteryMode::ForceDischarge);
        assert_eq!(config.cuj_mode, Some(CujMode::Tablet));
        assert_eq!(config.perf_level.as_deref(), Some("premium"));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(ScenarioConfig::from_params([("recrod", "true")]).is_err());
        assert!(ScenarioConfig::from_params([("tracing", "yes")]).is_err());
        assert!(ScenarioConfig::from_params([("cuj_mode", "laptop")]).is_err());
        assert!(ScenarioConfig::from_json(r#"{"record": true, "extra": 1}"#).is_err());
    }

    #[test]
    fn json_uses_harness_spelling() {
        let config =
            ScenarioConfig::from_json(r#"{"tracing": true, "batteryMode": "NoDischarge", "cuj_mute": true}"#)
                .unwrap();
        assert!(config.tracing && config.cuj_mute);
        assert_eq!(config.battery_mode, BatteryMode::NoDischarge);
        assert_eq!(ScenarioConfig::from_json("{}").unwrap(), ScenarioConfig::default());
    }
}
