//! Validated `DeviceOptions`, loaded from TOML with a per-field
//! `#[serde(default = "...")]` function, then an explicit `validate()`
//! pass after deserialisation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::DeviceModel;
use crate::error::ConfigError;

fn default_timeslice_ms() -> u32 {
    100
}
fn default_microstepping_mode() -> u8 {
    1
}
fn default_pen_up_position() -> u8 {
    60
}
fn default_pen_up_speed() -> u32 {
    150
}
fn default_pen_up_delay() -> u32 {
    0
}
fn default_pen_down_position() -> u8 {
    40
}
fn default_pen_down_speed() -> u32 {
    150
}
fn default_pen_down_delay() -> u32 {
    0
}
fn default_acceleration() -> f64 {
    16.0
}
fn default_max_velocity() -> f64 {
    4.0
}
fn default_corner_factor() -> f64 {
    0.001
}
fn default_model() -> String {
    "MiniKit2".to_string()
}

/// The configuration surface recognised by the core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceOptions {
    #[serde(default = "default_timeslice_ms")]
    pub timeslice_ms: u32,

    #[serde(default = "default_microstepping_mode")]
    pub microstepping_mode: u8,

    #[serde(default = "default_pen_up_position")]
    pub pen_up_position: u8,
    #[serde(default = "default_pen_up_speed")]
    pub pen_up_speed: u32,
    #[serde(default = "default_pen_up_delay")]
    pub pen_up_delay: u32,

    #[serde(default = "default_pen_down_position")]
    pub pen_down_position: u8,
    #[serde(default = "default_pen_down_speed")]
    pub pen_down_speed: u32,
    #[serde(default = "default_pen_down_delay")]
    pub pen_down_delay: u32,

    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    #[serde(default = "default_corner_factor")]
    pub corner_factor: f64,

    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            timeslice_ms: default_timeslice_ms(),
            microstepping_mode: default_microstepping_mode(),
            pen_up_position: default_pen_up_position(),
            pen_up_speed: default_pen_up_speed(),
            pen_up_delay: default_pen_up_delay(),
            pen_down_position: default_pen_down_position(),
            pen_down_speed: default_pen_down_speed(),
            pen_down_delay: default_pen_down_delay(),
            acceleration: default_acceleration(),
            max_velocity: default_max_velocity(),
            corner_factor: default_corner_factor(),
            model: default_model(),
        }
    }
}

impl DeviceOptions {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let options: DeviceOptions = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects out-of-range positions, negative speeds, and unknown
    /// device models.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.microstepping_mode < 1 || self.microstepping_mode > 5 {
            return Err(ConfigError::OutOfRange {
                field: "microstepping_mode",
                min: 1.0,
                max: 5.0,
                value: self.microstepping_mode as f64,
            });
        }
        if self.pen_up_position > 100 {
            return Err(ConfigError::OutOfRange {
                field: "pen_up_position",
                min: 0.0,
                max: 100.0,
                value: self.pen_up_position as f64,
            });
        }
        if self.pen_down_position > 100 {
            return Err(ConfigError::OutOfRange {
                field: "pen_down_position",
                min: 0.0,
                max: 100.0,
                value: self.pen_down_position as f64,
            });
        }
        if self.acceleration < 0.0 {
            return Err(ConfigError::Negative {
                field: "acceleration",
                value: self.acceleration,
            });
        }
        if self.max_velocity < 0.0 {
            return Err(ConfigError::Negative {
                field: "max_velocity",
                value: self.max_velocity,
            });
        }

        DeviceModel::lookup(&self.model)?;
        Ok(())
    }

    pub fn device_model(&self) -> DeviceModel {
        DeviceModel::lookup(&self.model).expect("validated before construction")
    }

    pub fn steps_per_mm(&self) -> f64 {
        self.device_model().steps_per_mm(self.microstepping_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = DeviceOptions::default();
        assert_eq!(options.timeslice_ms, 100);
        assert_eq!(options.pen_up_position, 60);
        assert_eq!(options.pen_down_position, 40);
        assert!((options.acceleration - 16.0).abs() < 1e-9);
        assert!((options.max_velocity - 4.0).abs() < 1e-9);
        assert!((options.corner_factor - 0.001).abs() < 1e-12);
        assert_eq!(options.model, "MiniKit2");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn out_of_range_pen_position_is_rejected() {
        let mut options = DeviceOptions::default();
        options.pen_up_position = 255;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::OutOfRange { field: "pen_up_position", .. })
        ));
    }

    #[test]
    fn negative_acceleration_is_rejected() {
        let mut options = DeviceOptions::default();
        options.acceleration = -1.0;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Negative { field: "acceleration", .. })
        ));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut options = DeviceOptions::default();
        options.model = "Unobtainium".to_string();
        assert!(matches!(options.validate(), Err(ConfigError::UnknownModel(_))));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_text = "acceleration = 20.0\nmodel = \"MiniKit1\"\n";
        let options: DeviceOptions = toml::from_str(toml_text).unwrap();
        assert!((options.acceleration - 20.0).abs() < 1e-9);
        assert_eq!(options.model, "MiniKit1");
        assert_eq!(options.timeslice_ms, 100);
    }
}
