//! Board point and set point definitions loaded from the JSON configuration
//! file.
//!
//! ```json
//! {
//!   "settings": { "logic": { "tick_ms": 500 } },
//!   "points": [
//!     { "id": "space_temp", "direction": "input", "data_type": "analog",
//!       "scaling": { "gain": 0.01, "offset": -40.0 } },
//!     { "id": "heater", "direction": "output", "data_type": "digital" }
//!   ],
//!   "set_points": [
//!     { "name": "zone1_heat", "target": 21.0, "rule": { "heat": { "hysteresis": 0.5 } },
//!       "input": "space_temp", "outputs": ["heater"] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::rules::ControlRule;
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("board point '{0}' is defined more than once")]
    DuplicatePoint(String),
    #[error("set point '{0}' is defined more than once")]
    DuplicateSetPoint(String),
    #[error("set point '{set_point}' references unknown board point '{point_id}'")]
    UnknownPoint { set_point: String, point_id: String },
    #[error("set point '{set_point}' needs '{point_id}' to be an {expected:?} point")]
    WrongDirection {
        set_point: String,
        point_id: String,
        expected: Direction,
    },
    #[error("set point '{0}' has no outputs")]
    NoOutputs(String),
    #[error("unknown set point '{0}'")]
    UnknownSetPoint(String),
    #[error("target {value} for set point '{name}' is not a finite number")]
    InvalidTarget { name: String, value: f64 },
    #[error("board point '{0}' has an unusable scaling (gain must be finite and non-zero)")]
    InvalidScaling(String),
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Analog,
    Digital,
}

/// Linear conversion between raw board counts and engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub gain: f64,
    pub offset: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl Scaling {
    pub fn to_engineering(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }

    pub fn to_raw(&self, value: f64) -> f64 {
        (value - self.offset) / self.gain
    }

    fn is_usable(&self) -> bool {
        self.gain.is_finite() && self.gain != 0.0 && self.offset.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardPoint {
    pub id: String,
    pub direction: Direction,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub scaling: Scaling,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPoint {
    pub name: String,
    pub target: f64,
    pub rule: ControlRule,
    pub input: String,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    settings: Settings,
    points: Vec<BoardPoint>,
    #[serde(default)]
    set_points: Vec<SetPoint>,
}

/// Validated view of the installation. Board points are immutable; set point
/// targets may be changed at runtime by clients.
#[derive(Debug)]
pub struct Configurator {
    points: BTreeMap<String, BoardPoint>,
    set_points: RwLock<BTreeMap<String, SetPoint>>,
}

impl Configurator {
    pub fn new(points: Vec<BoardPoint>, set_points: Vec<SetPoint>) -> Result<Self, ConfigError> {
        let mut by_id = BTreeMap::new();
        for point in points {
            if !point.scaling.is_usable() {
                return Err(ConfigError::InvalidScaling(point.id));
            }
            if by_id.contains_key(&point.id) {
                return Err(ConfigError::DuplicatePoint(point.id));
            }
            by_id.insert(point.id.clone(), point);
        }

        let mut by_name = BTreeMap::new();
        for set_point in set_points {
            validate_set_point(&set_point, &by_id)?;
            if by_name.contains_key(&set_point.name) {
                return Err(ConfigError::DuplicateSetPoint(set_point.name));
            }
            by_name.insert(set_point.name.clone(), set_point);
        }

        Ok(Self {
            points: by_id,
            set_points: RwLock::new(by_name),
        })
    }

    pub fn from_json(text: &str) -> Result<(Settings, Self), ConfigError> {
        let file: ConfigFile = serde_json::from_str(text)?;
        file.settings.validate()?;
        let config = Self::new(file.points, file.set_points)?;
        Ok((file.settings, config))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<(Settings, Self), ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let loaded = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            points = loaded.1.points.len(),
            set_points = loaded.1.set_points().len(),
            "configuration loaded"
        );
        Ok(loaded)
    }

    pub fn point(&self, id: &str) -> Option<&BoardPoint> {
        self.points.get(id)
    }

    pub fn points(&self) -> impl Iterator<Item = &BoardPoint> {
        self.points.values()
    }

    pub fn set_points(&self) -> Vec<SetPoint> {
        self.set_points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn set_point(&self, name: &str) -> Option<SetPoint> {
        self.set_points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn update_target(&self, name: &str, target: f64) -> Result<SetPoint, ConfigError> {
        if !target.is_finite() {
            return Err(ConfigError::InvalidTarget {
                name: name.to_string(),
                value: target,
            });
        }

        let mut set_points = self
            .set_points
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let set_point = set_points
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownSetPoint(name.to_string()))?;
        info!(set_point = name, from = set_point.target, to = target, "set point target changed");
        set_point.target = target;
        Ok(set_point.clone())
    }
}

fn validate_set_point(
    set_point: &SetPoint,
    points: &BTreeMap<String, BoardPoint>,
) -> Result<(), ConfigError> {
    if !set_point.target.is_finite() {
        return Err(ConfigError::InvalidTarget {
            name: set_point.name.clone(),
            value: set_point.target,
        });
    }
    if set_point.outputs.is_empty() {
        return Err(ConfigError::NoOutputs(set_point.name.clone()));
    }

    let check = |point_id: &String, expected: Direction| -> Result<(), ConfigError> {
        let point = points.get(point_id).ok_or_else(|| ConfigError::UnknownPoint {
            set_point: set_point.name.clone(),
            point_id: point_id.clone(),
        })?;
        if point.direction != expected {
            return Err(ConfigError::WrongDirection {
                set_point: set_point.name.clone(),
                point_id: point_id.clone(),
                expected,
            });
        }
        Ok(())
    };

    check(&set_point.input, Direction::Input)?;
    let mut seen = HashSet::new();
    for output in &set_point.outputs {
        check(output, Direction::Output)?;
        if !seen.insert(output) {
            return Err(ConfigError::DuplicatePoint(output.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "points": [
            { "id": "space_temp", "direction": "input",
              "scaling": { "gain": 0.01, "offset": -40.0 } },
            { "id": "heater", "direction": "output", "data_type": "digital" }
        ],
        "set_points": [
            { "name": "zone1_heat", "target": 21.0, "rule": { "heat": { "hysteresis": 0.5 } },
              "input": "space_temp", "outputs": ["heater"] }
        ]
    }"#;

    #[test]
    fn test_load_sample() {
        let (settings, config) = Configurator::from_json(SAMPLE).unwrap();
        assert_eq!(settings, Settings::default());
        let temp = config.point("space_temp").unwrap();
        assert!((temp.scaling.to_engineering(6_100.0) - 21.0).abs() < 1e-9);
        assert!((temp.scaling.to_raw(21.0) - 6_100.0).abs() < 1e-6);
        assert_eq!(config.set_point("zone1_heat").unwrap().outputs, ["heater"]);
    }

    #[test]
    fn test_output_used_as_input_rejected() {
        let text = SAMPLE.replace(r#""input": "space_temp""#, r#""input": "heater""#);
        assert!(matches!(
            Configurator::from_json(&text),
            Err(ConfigError::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_update_target() {
        let (_, config) = Configurator::from_json(SAMPLE).unwrap();
        assert_eq!(config.update_target("zone1_heat", 19.5).unwrap().target, 19.5);
        assert!(matches!(
            config.update_target("zone1_heat", f64::NAN),
            Err(ConfigError::InvalidTarget { .. })
        ));
        assert!(matches!(
            config.update_target("nope", 1.0),
            Err(ConfigError::UnknownSetPoint(_))
        ));
    }
}
